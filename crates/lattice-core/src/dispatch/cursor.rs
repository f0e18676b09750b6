//! Cursor protocol for resumable streaming dispatch.
//!
//! A [`Cursor`] is opaque to callers but structured here: an ordered list of
//! string sections plus a version. The first section may carry a routing tag
//! of the form `$s:<secondary-name>`, produced and consumed exclusively by
//! the cluster dispatcher; evaluators ignore it and never emit it. All
//! remaining sections are evaluator-internal progress state.
//!
//! An empty cursor is the start-of-stream marker.

use crate::types::Cursor;

use super::errors::DispatchError;

/// Current cursor layout version. Incremented on any incompatible change;
/// cursors with a different version are rejected.
pub const DISPATCH_CURSOR_VERSION: u32 = 1;

/// Routing tag prefix pinning a continuation to a named secondary.
pub const SECONDARY_CURSOR_PREFIX: &str = "$s:";

/// Rejects cursors minted under a different layout version.
pub fn validate_version(cursor: &Cursor) -> Result<(), DispatchError> {
    if cursor.dispatch_version != DISPATCH_CURSOR_VERSION {
        return Err(DispatchError::InvalidCursor(format!(
            "cursor version {} does not match expected version {}",
            cursor.dispatch_version, DISPATCH_CURSOR_VERSION
        )));
    }
    Ok(())
}

/// Returns the secondary name a cursor is pinned to, if any.
#[must_use]
pub fn pinned_secondary(cursor: &Cursor) -> Option<&str> {
    cursor
        .sections
        .first()
        .and_then(|section| section.strip_prefix(SECONDARY_CURSOR_PREFIX))
}

/// Returns a copy of the cursor with the routing tag removed, suitable for
/// forwarding to the pinned secondary's evaluator.
#[must_use]
pub fn without_pin(cursor: &Cursor) -> Cursor {
    if pinned_secondary(cursor).is_none() {
        return cursor.clone();
    }
    Cursor {
        sections: cursor.sections[1..].to_vec(),
        dispatch_version: cursor.dispatch_version,
    }
}

/// Prepends the routing tag for `secondary_name` to a producer's cursor.
///
/// A cursor that already carries a tag indicates a misrouted response from
/// a peer, which is a dispatcher bug rather than a caller error.
pub fn pin_to_secondary(cursor: Cursor, secondary_name: &str) -> Result<Cursor, DispatchError> {
    if let Some(existing) = pinned_secondary(&cursor) {
        return Err(DispatchError::Internal(format!(
            "response cursor already pinned to secondary `{existing}`"
        )));
    }

    let mut sections = Vec::with_capacity(cursor.sections.len() + 1);
    sections.push(format!("{SECONDARY_CURSOR_PREFIX}{secondary_name}"));
    sections.extend(cursor.sections);
    Ok(Cursor { sections, dispatch_version: cursor.dispatch_version })
}
