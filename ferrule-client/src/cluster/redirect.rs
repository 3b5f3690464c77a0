//! Classification of cluster error replies

use crate::config::{join_address, split_address};

/// Error replies the router reacts to; anything else is returned to the caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Redirect {
    /// Slot permanently owned by another node: refresh, then retry there
    Moved { slot: u16, address: String },
    /// Slot migrating: retry once on the target, preceded by `ASKING`
    Ask { slot: u16, address: String },
    /// Multi-key operation during resharding: back off, retry same node
    TryAgain,
    /// Cluster temporarily unable to serve: back off, retry same node
    ClusterDown,
}

impl Redirect {
    /// Classify an error reply by its leading token
    ///
    /// `MOVED`/`ASK` without a valid `<slot> <host:port>` tail are not
    /// redirects.
    pub fn parse(text: &str) -> Option<Self> {
        let mut parts = text.split_ascii_whitespace();
        match parts.next()? {
            "MOVED" => {
                let (slot, address) = slot_and_address(parts)?;
                Some(Redirect::Moved { slot, address })
            }
            "ASK" => {
                let (slot, address) = slot_and_address(parts)?;
                Some(Redirect::Ask { slot, address })
            }
            "TRYAGAIN" => Some(Redirect::TryAgain),
            "CLUSTERDOWN" => Some(Redirect::ClusterDown),
            _ => None,
        }
    }
}

/// Resolve a redirect address against the node that sent it
///
/// A server that does not know the target's endpoint sends `:<port>`; the
/// host is then the one `origin` was reached at.
pub fn resolve_target(address: &str, origin: &str) -> String {
    let Some(port) = address
        .strip_prefix(':')
        .and_then(|port| port.parse::<u16>().ok())
    else {
        return address.to_string();
    };
    match split_address(origin) {
        Ok((host, _)) => join_address(host, port),
        Err(_) => address.to_string(),
    }
}

fn slot_and_address<'a>(mut parts: impl Iterator<Item = &'a str>) -> Option<(u16, String)> {
    let slot: u16 = parts.next()?.parse().ok()?;
    if slot >= crate::slot::SLOT_COUNT {
        return None;
    }
    let address = parts.next()?;
    if !address.contains(':') {
        return None;
    }
    Some((slot, address.to_string()))
}
