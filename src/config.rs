//! Thin parsing for the two whitespace-tokenized configuration files,
//! `Common.cfg` and `PeerInfo.cfg`.
//!
//! Neither file is anything more elaborate than `key value` pairs per
//! line, so a hand-rolled tokenizer reads more plainly here than pulling
//! in `serde` for a format that isn't self-describing anyway.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::PeerId;

/// Settings shared by every peer, read from `Common.cfg`.
#[derive(Clone, Debug)]
pub struct CommonConfig {
    pub num_preferred_neighbors: usize,
    pub unchoking_interval: Duration,
    pub optimistic_unchoking_interval: Duration,
    pub file_name: String,
    pub file_size: u64,
    pub piece_size: u32,
}

impl CommonConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let map = parse_key_value_file(path.as_ref())?;
        let get = |key: &str| -> Result<&String> {
            map.get(key)
                .ok_or_else(|| Error::Config(format!("missing {} in Common.cfg", key)))
        };
        Ok(Self {
            num_preferred_neighbors: get("NumberOfPreferredNeighbors")?.parse()?,
            unchoking_interval: Duration::from_secs(get("UnchokingInterval")?.parse()?),
            optimistic_unchoking_interval: Duration::from_secs(
                get("OptimisticUnchokingInterval")?.parse()?,
            ),
            file_name: get("FileName")?.clone(),
            file_size: get("FileSize")?.parse()?,
            piece_size: get("PieceSize")?.parse()?,
        })
    }
}

fn parse_key_value_file(path: &Path) -> Result<HashMap<String, String>> {
    let text = std::fs::read_to_string(path)
        .map_err(|_| Error::Config(format!("cannot read {}", path.display())))?;
    let mut map = HashMap::new();
    for line in text.lines() {
        let mut tokens = line.split_whitespace();
        if let (Some(key), Some(value)) = (tokens.next(), tokens.next()) {
            map.insert(key.to_string(), value.to_string());
        }
    }
    Ok(map)
}

/// One line of `PeerInfo.cfg`: `<peer id> <host> <port> <has file: 0|1>`.
#[derive(Clone, Debug)]
pub struct PeerDescriptor {
    pub peer_id: PeerId,
    pub host: String,
    pub port: u16,
    pub starts_with_file: bool,
}

/// Parses `PeerInfo.cfg`, preserving the file's line order: the caller
/// relies on this order to decide which peers to dial outbound (everyone
/// listed before ourselves) versus wait on inbound (everyone after).
pub fn load_peer_roster(path: impl AsRef<Path>) -> Result<Vec<PeerDescriptor>> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .map_err(|_| Error::Config(format!("cannot read {}", path.display())))?;
    let mut roster = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() != 4 {
            return Err(Error::Config(format!(
                "malformed PeerInfo.cfg line: {:?}",
                line
            )));
        }
        roster.push(PeerDescriptor {
            peer_id: tokens[0].parse()?,
            host: tokens[1].to_string(),
            port: tokens[2].parse()?,
            starts_with_file: tokens[3] == "1",
        });
    }
    Ok(roster)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_temp(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_parse_common_config() {
        let file = write_temp(
            "NumberOfPreferredNeighbors 2\n\
             UnchokingInterval 5\n\
             OptimisticUnchokingInterval 15\n\
             FileName thefile.dat\n\
             FileSize 2167705\n\
             PieceSize 16384\n",
        );
        let cfg = CommonConfig::from_file(file.path()).unwrap();
        assert_eq!(cfg.num_preferred_neighbors, 2);
        assert_eq!(cfg.unchoking_interval, Duration::from_secs(5));
        assert_eq!(cfg.file_name, "thefile.dat");
        assert_eq!(cfg.file_size, 2167705);
        assert_eq!(cfg.piece_size, 16384);
    }

    #[test]
    fn test_common_config_missing_key_fails() {
        let file = write_temp("NumberOfPreferredNeighbors 2\n");
        assert!(CommonConfig::from_file(file.path()).is_err());
    }

    #[test]
    fn test_parse_peer_roster_preserves_order() {
        let file = write_temp(
            "1001 lin114-00.cise.ufl.edu 6008 1\n\
             1002 lin114-01.cise.ufl.edu 6008 0\n",
        );
        let roster = load_peer_roster(file.path()).unwrap();
        assert_eq!(roster.len(), 2);
        assert_eq!(roster[0].peer_id, 1001);
        assert!(roster[0].starts_with_file);
        assert_eq!(roster[1].peer_id, 1002);
        assert!(!roster[1].starts_with_file);
    }

    #[test]
    fn test_malformed_roster_line_fails() {
        let file = write_temp("1001 host 6008\n");
        assert!(load_peer_roster(file.path()).is_err());
    }
}
