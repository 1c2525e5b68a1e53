//! Network transport contract
//!
//! The engine issues one GET per attempt and consumes the body chunk by
//! chunk, applying its own read-inactivity timeout around each chunk.

use crate::error::DeviceError;

/// Response body of a firmware download
#[async_trait::async_trait]
pub trait ByteStream: Send {
    /// Next chunk of the body, `None` at end of body
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, DeviceError>;
}

/// An open download
pub struct Download {
    /// Declared body length, when the server sent one
    pub content_length: Option<u64>,
    /// Body stream
    pub body: Box<dyn ByteStream>,
}

impl std::fmt::Debug for Download {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Download")
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

/// Fetches firmware artifacts over the network
#[async_trait::async_trait]
pub trait FirmwareTransport: Send + Sync {
    /// Start a GET of `url`, sending `bearer` as the authorization token if given
    async fn get(&self, url: &str, bearer: Option<&str>) -> Result<Download, DeviceError>;
}

/// URL of the manifest published next to an image URL
///
/// `https://host/fw/firmware.bin` maps to `https://host/fw/firmware_info.json`.
pub fn sibling_manifest_url(image_url: &str, manifest_name: &str) -> String {
    let (without_query, _) = image_url
        .split_once(['?', '#'])
        .unwrap_or((image_url, ""));
    let path_start = without_query.find("://").map_or(0, |i| i + 3);
    let last_slash = without_query
        .get(path_start..)
        .and_then(|rest| rest.rfind('/'))
        .map(|i| path_start + i);
    match last_slash.and_then(|cut| without_query.get(..=cut)) {
        Some(base) => format!("{base}{manifest_name}"),
        None => format!("{without_query}/{manifest_name}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sibling_manifest_url() {
        assert_eq!(
            sibling_manifest_url("https://ota.example/fw/firmware.bin", "firmware_info.json"),
            "https://ota.example/fw/firmware_info.json"
        );
        assert_eq!(
            sibling_manifest_url("https://ota.example/fw/firmware.bin?v=3", "firmware_info.json"),
            "https://ota.example/fw/firmware_info.json"
        );
        assert_eq!(
            sibling_manifest_url("https://ota.example/fw/", "firmware_info.json"),
            "https://ota.example/fw/firmware_info.json"
        );
        assert_eq!(
            sibling_manifest_url("https://ota.example", "firmware_info.json"),
            "https://ota.example/firmware_info.json"
        );
    }
}
