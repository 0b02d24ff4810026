//! Virtual document conversion.
//!
//! A virtual document has no byte stream of its own; its provider offers a set
//! of export mime types instead. Picking one is a pure function over the
//! requested type and the offered types. The chosen type's extension is then
//! appended to the destination name (`tokyo.sth` becomes `tokyo.sth.pdf`).

/// Export type preferred when the request leaves the choice open.
pub const DEFAULT_EXPORT_MIME: &str = "application/pdf";

/// Fallback mime type for names with no known extension.
pub const OCTET_STREAM: &str = "application/octet-stream";

/// Common extensions for types that register several.
const PREFERRED_EXTENSIONS: &[(&str, &str)] = &[
    ("text/plain", "txt"),
    ("text/html", "html"),
    ("image/jpeg", "jpg"),
    ("audio/mpeg", "mp3"),
];

/// True if `mime_type` satisfies `pattern` (`*/*`, `image/*` or an exact type).
pub fn mime_matches(pattern: &str, mime_type: &str) -> bool {
    if pattern == "*/*" {
        return true;
    }
    match (pattern.split_once('/'), mime_type.split_once('/')) {
        (Some((p_top, "*")), Some((m_top, _))) => p_top.eq_ignore_ascii_case(m_top),
        _ => pattern.eq_ignore_ascii_case(mime_type),
    }
}

/// Choose the export type for a virtual document.
///
/// Among the offered types that satisfy `required`, an exact match wins, then
/// `application/pdf`, then the first offered. `None` means the document cannot
/// be converted to anything acceptable.
pub fn select_export_type<'a>(required: &str, available: &'a [String]) -> Option<&'a str> {
    let candidates: Vec<&str> = available
        .iter()
        .map(String::as_str)
        .filter(|offered| mime_matches(required, offered))
        .collect();

    candidates
        .iter()
        .find(|offered| offered.eq_ignore_ascii_case(required))
        .or_else(|| {
            candidates
                .iter()
                .find(|offered| offered.eq_ignore_ascii_case(DEFAULT_EXPORT_MIME))
        })
        .or_else(|| candidates.first())
        .copied()
}

/// File extension for a mime type, if one is registered.
///
/// Prefers an extension that maps back to the same type.
pub fn extension_for_mime(mime_type: &str) -> Option<&'static str> {
    if let Some((_, ext)) = PREFERRED_EXTENSIONS
        .iter()
        .find(|(mime, _)| mime.eq_ignore_ascii_case(mime_type))
    {
        return Some(*ext);
    }
    let extensions = mime_guess::get_mime_extensions_str(mime_type)?;
    extensions
        .iter()
        .find(|ext| {
            mime_guess::from_ext(ext)
                .first_raw()
                .map_or(false, |guess| guess.eq_ignore_ascii_case(mime_type))
        })
        .or_else(|| extensions.first())
        .copied()
}

/// Mime type for a display name, guessed from its extension.
pub fn mime_for_name(name: &str) -> &'static str {
    mime_guess::from_path(name).first_raw().unwrap_or(OCTET_STREAM)
}

/// Destination name for a converted document.
///
/// The export type's extension is appended unless the name already ends with
/// one of the type's extensions; names stay untouched when the type has no
/// registered extension.
pub fn converted_display_name(name: &str, export_mime: &str) -> String {
    let Some(ext) = extension_for_mime(export_mime) else {
        return name.to_string();
    };
    let lower = name.to_ascii_lowercase();
    let known = mime_guess::get_mime_extensions_str(export_mime).unwrap_or(&[]);
    let has_extension = std::iter::once(ext)
        .chain(known.iter().copied())
        .any(|known| lower.ends_with(&format!(".{}", known)));
    if has_extension {
        name.to_string()
    } else {
        format!("{}.{}", name, ext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offered(types: &[&str]) -> Vec<String> {
        types.iter().map(|t| t.to_string()).collect()
    }

    #[test]
    fn test_only_pdf_offered() {
        let available = offered(&["application/pdf"]);
        assert_eq!(select_export_type("*/*", &available), Some("application/pdf"));
        assert_eq!(
            select_export_type("application/pdf", &available),
            Some("application/pdf")
        );
    }

    #[test]
    fn test_nothing_offered_fails() {
        assert_eq!(select_export_type("*/*", &[]), None);
    }

    #[test]
    fn test_required_type_not_offered_fails() {
        let available = offered(&["image/png"]);
        assert_eq!(select_export_type("application/pdf", &available), None);
    }

    #[test]
    fn test_exact_match_wins_over_pdf() {
        let available = offered(&["application/pdf", "image/png"]);
        assert_eq!(select_export_type("image/png", &available), Some("image/png"));
    }

    #[test]
    fn test_pdf_preferred_for_open_request() {
        let available = offered(&["image/png", "application/pdf"]);
        assert_eq!(select_export_type("*/*", &available), Some("application/pdf"));
    }

    #[test]
    fn test_wildcard_subtype() {
        let available = offered(&["application/pdf", "image/jpeg", "image/png"]);
        assert_eq!(select_export_type("image/*", &available), Some("image/jpeg"));
    }

    #[test]
    fn test_converted_name_appends_extension() {
        assert_eq!(
            converted_display_name("tokyo.sth", "application/pdf"),
            "tokyo.sth.pdf"
        );
        assert_eq!(converted_display_name("report.PDF", "application/pdf"), "report.PDF");
        assert_eq!(converted_display_name("blob", "x-custom/unknown"), "blob");
    }

    #[test]
    fn test_converted_name_for_less_common_types() {
        for mime in ["application/rtf", "image/tiff", "application/epub+zip", "image/bmp"] {
            let converted = converted_display_name("budget", mime);
            assert!(converted.starts_with("budget."), "{} gave {}", mime, converted);
            assert!(converted.len() > "budget.".len());
        }
        assert_eq!(converted_display_name("notes", "text/plain"), "notes.txt");
        assert_eq!(converted_display_name("photo", "image/jpeg"), "photo.jpg");
        assert_eq!(converted_display_name("photo.jpeg", "image/jpeg"), "photo.jpeg");
    }

    #[test]
    fn test_extension_maps_back_to_type() {
        assert_eq!(extension_for_mime("application/pdf"), Some("pdf"));
        assert_eq!(extension_for_mime("application/rtf"), Some("rtf"));
        assert_eq!(extension_for_mime("x-custom/unknown"), None);
    }

    #[test]
    fn test_mime_for_name() {
        assert_eq!(mime_for_name("notes.txt"), "text/plain");
        assert_eq!(mime_for_name("photo.JPEG"), "image/jpeg");
        assert_eq!(mime_for_name("paper.pdf"), "application/pdf");
        assert_eq!(mime_for_name("clip.mov"), "video/quicktime");
        assert_eq!(mime_for_name("Makefile"), OCTET_STREAM);
        assert_eq!(mime_for_name("data.unknownext"), OCTET_STREAM);
    }
}
