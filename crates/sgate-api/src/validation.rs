//! Submission validation.
//!
//! Everything here runs before a job touches the store or the queue, so a
//! rejected request leaves no trace.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

use sgate_models::{RenditionProfile, MAX_PRIORITY};

use crate::error::{ApiError, ApiResult};

pub const MAX_CONTENT_ID_LEN: usize = 128;
pub const MAX_INPUT_REF_LEN: usize = 2048;
pub const MAX_PROFILES: usize = 16;

static CONTENT_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._:\-]*$").expect("valid content id regex"));

static PROFILE_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_\-]*$").expect("valid profile name regex"));

pub fn validate_content_id(content_id: &str) -> ApiResult<()> {
    if content_id.is_empty() {
        return Err(ApiError::validation("content_id must not be empty"));
    }
    if content_id.len() > MAX_CONTENT_ID_LEN {
        return Err(ApiError::validation(format!(
            "content_id exceeds {} characters",
            MAX_CONTENT_ID_LEN
        )));
    }
    if !CONTENT_ID.is_match(content_id) {
        return Err(ApiError::validation(
            "content_id may only contain letters, digits, '.', '_', ':' and '-'",
        ));
    }
    Ok(())
}

pub fn validate_input_ref(input_ref: &str) -> ApiResult<()> {
    if input_ref.trim().is_empty() {
        return Err(ApiError::validation("input_ref must not be empty"));
    }
    if input_ref.len() > MAX_INPUT_REF_LEN {
        return Err(ApiError::validation(format!(
            "input_ref exceeds {} characters",
            MAX_INPUT_REF_LEN
        )));
    }
    Ok(())
}

pub fn validate_priority(priority: u8) -> ApiResult<()> {
    if priority > MAX_PRIORITY {
        return Err(ApiError::validation(format!(
            "priority must be between 0 and {}, got {}",
            MAX_PRIORITY, priority
        )));
    }
    Ok(())
}

pub fn validate_profile(profile: &RenditionProfile) -> ApiResult<()> {
    let name = &profile.name;
    if !PROFILE_NAME.is_match(name) {
        return Err(ApiError::validation(format!("invalid profile name '{}'", name)));
    }
    if profile.bitrate_kbps == 0 {
        return Err(ApiError::validation(format!("profile '{}': bitrate must be positive", name)));
    }
    if profile.resolution.width == 0 || profile.resolution.height == 0 {
        return Err(ApiError::validation(format!(
            "profile '{}': resolution must be non-zero",
            name
        )));
    }
    if !profile.container.supports(profile.codec) {
        return Err(ApiError::validation(format!(
            "profile '{}': {} cannot carry {}",
            name,
            profile.container.as_str(),
            profile.codec
        )));
    }
    if let Some(secs) = profile.expected_duration_secs {
        if !secs.is_finite() || secs <= 0.0 {
            return Err(ApiError::validation(format!(
                "profile '{}': expected duration must be positive",
                name
            )));
        }
    }
    Ok(())
}

/// At least one profile, at most [`MAX_PROFILES`], names unique.
pub fn validate_profiles(profiles: &[RenditionProfile]) -> ApiResult<()> {
    if profiles.is_empty() {
        return Err(ApiError::validation("at least one rendition profile is required"));
    }
    if profiles.len() > MAX_PROFILES {
        return Err(ApiError::validation(format!(
            "at most {} rendition profiles per job",
            MAX_PROFILES
        )));
    }
    let mut seen = HashSet::new();
    for profile in profiles {
        validate_profile(profile)?;
        if !seen.insert(profile.name.as_str()) {
            return Err(ApiError::validation(format!(
                "duplicate profile name '{}'",
                profile.name
            )));
        }
    }
    Ok(())
}

/// Expand preset names (`1080p`, `720p`, ...) into profiles.
pub fn presets(names: &[&str]) -> ApiResult<Vec<RenditionProfile>> {
    names
        .iter()
        .map(|name| {
            RenditionProfile::preset(name)
                .ok_or_else(|| ApiError::validation(format!("unknown preset '{}'", name)))
        })
        .collect()
}
