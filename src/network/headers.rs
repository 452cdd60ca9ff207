/// HTTP header parsing utilities
use reqwest::header::CONTENT_DISPOSITION;

/// Extracts filename from HTTP response headers or URL
///
/// Tries in order:
/// 1. Content-Disposition header
/// 2. URL path segments
/// 3. Falls back to "download.dat"
///
/// # Arguments
/// * `response` - The HTTP response to extract filename from
/// * `url` - The original URL (used as fallback)
///
/// # Returns
/// The extracted filename, sanitized and ready to use
pub fn extract_filename(response: &reqwest::Response, url: &str) -> String {
    let mut filename = "download.dat".to_string();

    // Try Content-Disposition header first
    if let Some(disp) = response.headers().get(CONTENT_DISPOSITION) {
        if let Ok(disp_str) = disp.to_str() {
            if let Some(name_part) = disp_str.split("filename=").nth(1) {
                filename = name_part
                    .trim()
                    .trim_matches('"')
                    .trim_matches('\'')
                    .to_string();
                return filename;
            }
        }
    }

    // Fallback to URL path
    if let Ok(parsed_url) = url::Url::parse(url) {
        if let Some(segments) = parsed_url.path_segments() {
            if let Some(last) = segments.last() {
                if !last.is_empty() {
                    filename = last.to_string();
                }
            }
        }
    }

    sanitize_filename::sanitize(filename)
}

/// Derives a content type from a file extension (used by the widget HTML
/// preprocessor when storing static resources, §4.7 step 5).
pub fn content_type_from_extension(filename: &str) -> &'static str {
    let ext = std::path::Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    match ext.as_str() {
        "css" => "text/css",
        "js" => "application/javascript",
        "json" => "application/json",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "ttf" => "font/ttf",
        "otf" => "font/otf",
        "eot" => "application/vnd.ms-fontobject",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "mp4" => "video/mp4",
        "html" | "htm" => "text/html",
        _ => "application/octet-stream",
    }
}

/// §4.2 edge case: a 2xx response with a `text/plain` or `text/html`
/// content-type where a binary type was expected signals corrupt cache
/// input (e.g. an error page served with a 200).
pub fn is_unexpected_text_response(content_type: Option<&str>, expected_binary: bool) -> bool {
    if !expected_binary {
        return false;
    }
    matches!(
        content_type.map(|c| c.split(';').next().unwrap_or("").trim()),
        Some("text/plain") | Some("text/html")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_type_from_known_extension() {
        assert_eq!(content_type_from_extension("fonts.css"), "text/css");
        assert_eq!(content_type_from_extension("bundle.min.js"), "application/javascript");
        assert_eq!(content_type_from_extension("logo.png"), "image/png");
    }

    #[test]
    fn content_type_falls_back_to_octet_stream() {
        assert_eq!(content_type_from_extension("mystery"), "application/octet-stream");
    }

    #[test]
    fn text_response_flagged_only_when_binary_expected() {
        assert!(is_unexpected_text_response(Some("text/html; charset=utf-8"), true));
        assert!(!is_unexpected_text_response(Some("text/html"), false));
        assert!(!is_unexpected_text_response(Some("image/jpeg"), true));
    }
}
