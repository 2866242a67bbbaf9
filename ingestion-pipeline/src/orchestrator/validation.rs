//! Input checks applied before any knowledge record is created.

use std::{
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    path::Path,
    sync::LazyLock,
};

use chrono::Utc;
use common::error::AppError;
use regex::Regex;
use tracing::warn;
use url::Url;

const ALLOWED_FILE_TYPES: &[&str] = &[
    "pdf", "txt", "docx", "doc", "md", "markdown", "png", "jpg", "jpeg", "gif", "csv", "xlsx",
    "xls",
];

const IMAGE_FILE_TYPES: &[&str] = &["jpg", "jpeg", "png", "gif", "webp", "bmp", "svg", "tiff"];

/// Extensions a URL may end in to be downloaded as a file instead of crawled.
pub const FILE_URL_TYPES: &[&str] = &["txt", "md", "pdf", "docx", "doc"];

const BLOCKED_HOSTS: &[&str] = &["localhost", "metadata.google.internal"];

const MAX_INPUT_CHARS: usize = 255;

const MANUAL_FILE_EXTENSION: &str = ".md";

static SCRIPT_BLOCK: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?is)<script\b[^>]*>.*?</script\s*>").ok());
static IFRAME_BLOCK: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?is)<iframe\b[^>]*>.*?</iframe\s*>").ok());
static JAVASCRIPT_LINK: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?i)\]\(\s*javascript:[^)]*\)").ok());

/// Lower-cased extension of a file name, without the dot.
pub fn file_type_of(file_name: &str) -> String {
    Path::new(file_name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default()
}

pub fn is_allowed_file_type(file_type: &str) -> bool {
    ALLOWED_FILE_TYPES.contains(&file_type.to_ascii_lowercase().as_str())
}

pub fn is_image_type(file_type: &str) -> bool {
    IMAGE_FILE_TYPES.contains(&file_type.to_ascii_lowercase().as_str())
}

pub fn is_file_url_type(file_type: &str) -> bool {
    FILE_URL_TYPES.contains(&file_type.to_ascii_lowercase().as_str())
}

/// Whether a URL should be downloaded as a file rather than crawled as a page.
/// An explicit file name or type hint always selects the file route.
pub fn is_file_url(url: &str, file_name_hint: &str, file_type_hint: &str) -> bool {
    if !file_name_hint.trim().is_empty() || !file_type_hint.trim().is_empty() {
        return true;
    }
    Url::parse(url)
        .ok()
        .map(|parsed| file_type_of(parsed.path()))
        .is_some_and(|ext| is_file_url_type(&ext))
}

/// Last non-empty path segment of a URL.
pub fn url_base_name(url: &Url) -> Option<String> {
    url.path_segments()
        .and_then(|mut segments| segments.rfind(|segment| !segment.is_empty()))
        .map(str::to_string)
}

/// Parses `raw` and rejects anything that is not a public http(s) address.
pub fn parse_public_url(raw: &str) -> Result<Url, AppError> {
    let url = Url::parse(raw.trim())
        .map_err(|_| AppError::Validation(format!("invalid URL: {raw}")))?;
    ensure_url_allowed(&url)?;
    Ok(url)
}

pub fn ensure_url_allowed(url: &Url) -> Result<(), AppError> {
    match url.scheme() {
        "http" | "https" => {}
        scheme => {
            warn!(%url, %scheme, "Rejected ingestion URL due to unsupported scheme");
            return Err(AppError::Validation(
                "Unsupported URL scheme for ingestion".to_string(),
            ));
        }
    }

    let Some(host) = url.host_str() else {
        warn!(%url, "Rejected ingestion URL missing host");
        return Err(AppError::Validation(
            "URL is missing a host component".to_string(),
        ));
    };

    let host = host.trim_start_matches('[').trim_end_matches(']');
    if BLOCKED_HOSTS
        .iter()
        .any(|blocked| host.eq_ignore_ascii_case(blocked))
    {
        warn!(%url, host, "Rejected ingestion URL to internal host");
        return Err(AppError::Validation(
            "Ingestion URL host is not allowed".to_string(),
        ));
    }

    if let Ok(ip) = host.parse::<IpAddr>() {
        if is_restricted_ip(ip) {
            warn!(%url, host, %ip, "Rejected ingestion URL pointing to restricted network range");
            return Err(AppError::Validation(
                "Ingestion URL host is not allowed".to_string(),
            ));
        }
    }

    Ok(())
}

fn is_restricted_ip(ip: IpAddr) -> bool {
    if ip.is_loopback() || ip.is_unspecified() || ip.is_multicast() {
        return true;
    }
    match ip {
        IpAddr::V4(v4) => is_restricted_v4(v4),
        IpAddr::V6(v6) => {
            v6.is_unique_local()
                || v6.is_unicast_link_local()
                || is_documentation_v6(v6)
                || v6.to_ipv4_mapped().is_some_and(is_restricted_v4)
        }
    }
}

fn is_restricted_v4(v4: Ipv4Addr) -> bool {
    v4.is_private()
        || v4.is_loopback()
        || v4.is_link_local()
        || v4.is_unspecified()
        || v4.is_broadcast()
        || v4.is_documentation()
}

fn is_documentation_v6(v6: Ipv6Addr) -> bool {
    matches!(v6.segments(), [0x2001, 0x0db8, ..])
}

/// Trims `input` and rejects control characters, script payloads and
/// anything longer than 255 characters.
pub fn sanitize_input(input: &str) -> Option<String> {
    sanitize_text(input, Some(MAX_INPUT_CHARS))
}

/// Same checks as [`sanitize_input`] without the length cap; line breaks are kept.
pub fn sanitize_passage(input: &str) -> Option<String> {
    sanitize_text(input, None)
}

fn sanitize_text(input: &str, max_chars: Option<usize>) -> Option<String> {
    let trimmed = input.trim();
    if max_chars.is_some_and(|max| trimmed.chars().count() > max) {
        return None;
    }
    let multiline = max_chars.is_none();
    if trimmed
        .chars()
        .any(|c| c.is_control() && c != '\t' && !(multiline && matches!(c, '\n' | '\r')))
    {
        return None;
    }
    let lower = trimmed.to_lowercase();
    if lower.contains("<script") || lower.contains("javascript:") {
        return None;
    }
    Some(trimmed.to_string())
}

/// Removes script and iframe blocks and `javascript:` link targets.
pub fn clean_markdown(content: &str) -> String {
    let mut cleaned = content.to_string();
    if let Some(re) = SCRIPT_BLOCK.as_ref() {
        cleaned = re.replace_all(&cleaned, "").into_owned();
    }
    if let Some(re) = IFRAME_BLOCK.as_ref() {
        cleaned = re.replace_all(&cleaned, "").into_owned();
    }
    if let Some(re) = JAVASCRIPT_LINK.as_ref() {
        cleaned = re.replace_all(&cleaned, "]()").into_owned();
    }
    cleaned
}

/// File name a manual note is stored and parsed under: the title with a
/// `.md` suffix, or a timestamped name for an empty title.
pub fn ensure_manual_file_name(title: &str) -> String {
    let trimmed = title.trim();
    if trimmed.is_empty() {
        return format!(
            "manual-{}{MANUAL_FILE_EXTENSION}",
            Utc::now().format("%Y%m%d-%H%M%S")
        );
    }
    if trimmed.to_lowercase().ends_with(MANUAL_FILE_EXTENSION) {
        return trimmed.to_string();
    }
    format!("{trimmed}{MANUAL_FILE_EXTENSION}")
}
