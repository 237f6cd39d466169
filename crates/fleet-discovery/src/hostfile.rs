use std::path::Path;

use crate::errors::DiscoveryError;

pub async fn read_host_file(path: &Path) -> Result<Vec<String>, DiscoveryError> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| DiscoveryError::HostFile {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(parse_host_list(&contents))
}

pub fn parse_host_list(contents: &str) -> Vec<String> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}
