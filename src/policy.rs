use regex::Regex;

use crate::error::{HookError, Rejection};
use crate::types::{ChangeEvent, EventKind, Watch, WatchSpec};

/// Decides whether `event` may produce a trigger for `watch`.
///
/// Checks run in order: event kind enabled, tag include/exclude patterns,
/// then the watch's `enabled` flag. An invalid pattern is a configuration
/// error, not a rejection.
pub fn evaluate(watch: &Watch, event: &ChangeEvent) -> Result<(), HookError> {
    if !watch.is_event_enabled(event.kind) {
        return Err(Rejection::EventDisabled(event.kind.as_str()).into());
    }

    if event.kind == EventKind::Tag {
        let tag = event.tag.as_deref().unwrap_or_default();
        if let Some(include) = pattern(watch.spec.tag_include_regexp.as_deref())? {
            if !include.is_match(tag) {
                return Err(Rejection::TagNotIncluded(tag.to_string()).into());
            }
        }
        if let Some(exclude) = pattern(watch.spec.tag_exclude_regexp.as_deref())? {
            if exclude.is_match(tag) {
                return Err(Rejection::TagExcluded(tag.to_string()).into());
            }
        }
    }

    if !watch.spec.enabled {
        return Err(Rejection::ReceiverDisabled.into());
    }
    Ok(())
}

/// Compiles the tag patterns so a broken watch is refused up front.
pub fn validate(spec: &WatchSpec) -> Result<(), HookError> {
    pattern(spec.tag_include_regexp.as_deref())?;
    pattern(spec.tag_exclude_regexp.as_deref())?;
    Ok(())
}

fn pattern(raw: Option<&str>) -> Result<Option<Regex>, HookError> {
    match raw.filter(|p| !p.is_empty()) {
        None => Ok(None),
        Some(raw) => Regex::new(raw)
            .map(Some)
            .map_err(|e| HookError::Config(format!("invalid tag pattern '{raw}': {e}"))),
    }
}
