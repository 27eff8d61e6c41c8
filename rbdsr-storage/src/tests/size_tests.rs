use super::{GIB, MIB};
use crate::overlay::parse_size;
use rbdsr_core::ErrorKind;

#[test]
fn test_parse_size_units() {
    let cases = [
        ("1024", 1024 * MIB),
        ("500M", 500 * MIB),
        ("500MB", 500 * MIB),
        ("10G", 10 * GIB),
        ("10gb", 10 * GIB),
        (" 2T ", 2048 * GIB),
        ("512K", 512 * 1024),
        ("1.5G", 1536 * MIB),
        ("0.5", 512 * 1024),
    ];

    for (text, expected) in cases {
        assert_eq!(parse_size(text).unwrap(), expected, "{text}");
    }
}

#[test]
fn test_parse_size_rejects_malformed_input() {
    for text in ["", "G", "ten", "-1G", "1.2.3G", "10X", "1,5G", ".5G", "5.G", "0", "0M"] {
        let err = parse_size(text).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigInvalid, "{text}");
        assert!(err.to_string().contains("1024, 500M, 10G or 2T"));
    }
}
