use std::path::Path;

fn extension_lowercase(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

/// Plain (textual) G-code, the format whose metadata lives at both ends of
/// the file: the preview in the header, the final stats at the tail.
pub fn is_plain_gcode(path: &Path) -> bool {
    matches!(
        extension_lowercase(path).as_deref(),
        Some("gcode") | Some("gco") | Some("g")
    )
}

/// Anything a printer could consume, plain or binary.
pub fn is_printable(path: &Path) -> bool {
    is_plain_gcode(path)
        || matches!(
            extension_lowercase(path).as_deref(),
            Some("bgcode") | Some("bgc")
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(is_plain_gcode("/usb/model.gcode".as_ref()));
        assert!(is_plain_gcode("/usb/MODEL.GCODE".as_ref()));
        assert!(is_plain_gcode("/usb/model.gco".as_ref()));
        assert!(!is_plain_gcode("/usb/model.bgcode".as_ref()));
        assert!(!is_plain_gcode("/usb/archive.zip".as_ref()));
        assert!(!is_plain_gcode("/usb/gcode".as_ref()));

        assert!(is_printable("/usb/model.gcode".as_ref()));
        assert!(is_printable("/usb/model.bgcode".as_ref()));
        assert!(!is_printable("/usb/firmware.bbf".as_ref()));
    }
}
