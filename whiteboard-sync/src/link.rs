//! Share links.
//!
//! Link format: `<origin>/#room=<RoomId>,<token>`
//!
//! Room id and key live in the fragment, which browsers never put on the
//! wire, so the link is the only channel that carries the key.

use url::Url;

use crate::room::{KeyError, RoomCredentials, RoomId};

/// Fragment prefix that marks a room link.
pub const FRAGMENT_PREFIX: &str = "room=";

/// Why a link could not be turned into a room.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LinkError {
    #[error("invalid origin: {0}")]
    InvalidOrigin(String),
    #[error("invalid link: {0}")]
    InvalidUrl(String),
    #[error("link has no room fragment")]
    MissingFragment,
    #[error("room fragment is malformed")]
    MalformedFragment,
}

/// Room id and exported key token as carried by a link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomLink {
    pub room_id: RoomId,
    pub token: String,
}

impl RoomLink {
    /// Import the token into usable credentials.
    pub fn credentials(&self) -> Result<RoomCredentials, KeyError> {
        RoomCredentials::from_parts(self.room_id.as_str(), &self.token)
    }
}

/// Build a share link for `room_id` under `origin`.
///
/// Any path or query on `origin` is dropped; the link always points at the
/// application root.
pub fn encode_share_link(room_id: &RoomId, token: &str, origin: &str) -> Result<Url, LinkError> {
    let mut url = Url::parse(origin).map_err(|e| LinkError::InvalidOrigin(e.to_string()))?;
    if url.cannot_be_a_base() {
        return Err(LinkError::InvalidOrigin(format!("{origin} cannot carry a path")));
    }
    url.set_path("/");
    url.set_query(None);
    url.set_fragment(Some(&format!("{FRAGMENT_PREFIX}{room_id},{token}")));
    Ok(url)
}

/// Parse a full link, reporting why it does not name a room.
pub fn parse_share_link(link: &str) -> Result<RoomLink, LinkError> {
    let url = Url::parse(link).map_err(|e| LinkError::InvalidUrl(e.to_string()))?;
    let fragment = url.fragment().ok_or(LinkError::MissingFragment)?;
    parse_fragment(fragment)
}

/// Parse just the fragment, with or without the leading `#`.
pub fn parse_fragment(fragment: &str) -> Result<RoomLink, LinkError> {
    let fragment = fragment.strip_prefix('#').unwrap_or(fragment);
    let data = fragment
        .strip_prefix(FRAGMENT_PREFIX)
        .ok_or(LinkError::MissingFragment)?;

    let (room, token) = data.split_once(',').ok_or(LinkError::MalformedFragment)?;
    if token.is_empty() || token.contains(',') {
        return Err(LinkError::MalformedFragment);
    }
    let room_id = RoomId::parse(room).map_err(|_| LinkError::MalformedFragment)?;

    Ok(RoomLink {
        room_id,
        token: token.to_string(),
    })
}

/// Best-effort decode: `None` means "no room here, run standalone".
pub fn decode_share_link(link: &str) -> Option<RoomLink> {
    match parse_share_link(link) {
        Ok(room) => Some(room),
        Err(e) => {
            // The link itself may hold a key, so only the reason is logged.
            log::debug!("No room found in link: {e}");
            None
        }
    }
}
