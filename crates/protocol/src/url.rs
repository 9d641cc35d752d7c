//! WebUSB URL descriptor decoding
//!
//! The landing page is fetched with a vendor control transfer
//! (bmRequestType 0xC0, bRequest = bVendorCode, wValue = iLandingPage,
//! wIndex = GET_URL). The reply is a URL descriptor: bLength,
//! bDescriptorType, bScheme, then the UTF-8 URL without its scheme prefix.

/// wIndex selecting the GET_URL request
pub const GET_URL_REQUEST: u16 = 0x02;

/// wLength used for the GET_URL request
pub const URL_DESCRIPTOR_MAX_LENGTH: u16 = 64;

/// Size of the URL descriptor header
const URL_HEADER_SIZE: usize = 3;

/// URL scheme prefix encoded by bScheme
///
/// Any value other than 0 or 1 (commonly 255) means the URL bytes already
/// carry their own scheme.
pub fn scheme_prefix(scheme: u8) -> &'static str {
    match scheme {
        0 => "http://",
        1 => "https://",
        _ => "",
    }
}

/// Decode a URL descriptor into a complete URL
///
/// Returns `None` when the buffer is too short to hold the header. The URL
/// runs to bLength when bLength is plausible, otherwise to the end of the
/// buffer. Invalid UTF-8 sequences are replaced rather than rejected.
pub fn decode_url_descriptor(buf: &[u8]) -> Option<String> {
    if buf.len() < URL_HEADER_SIZE {
        return None;
    }

    let declared = buf[0] as usize;
    let end = if (URL_HEADER_SIZE..=buf.len()).contains(&declared) {
        declared
    } else {
        buf.len()
    };

    let url = String::from_utf8_lossy(&buf[URL_HEADER_SIZE..end]);
    Some(format!("{}{}", scheme_prefix(buf[2]), url))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(scheme: u8, url: &str) -> Vec<u8> {
        let mut buf = vec![(url.len() + 3) as u8, 0x03, scheme];
        buf.extend_from_slice(url.as_bytes());
        buf
    }

    #[test]
    fn test_decode_url_schemes() {
        assert_eq!(
            decode_url_descriptor(&descriptor(0, "example.com")).as_deref(),
            Some("http://example.com")
        );
        assert_eq!(
            decode_url_descriptor(&descriptor(1, "example.com")).as_deref(),
            Some("https://example.com")
        );
        assert_eq!(
            decode_url_descriptor(&descriptor(255, "https://foo")).as_deref(),
            Some("https://foo")
        );
    }

    #[test]
    fn test_decode_url_respects_declared_length() {
        let mut buf = descriptor(1, "example.com");
        buf.extend_from_slice(&[0; 16]);
        assert_eq!(
            decode_url_descriptor(&buf).as_deref(),
            Some("https://example.com")
        );

        // bLength larger than what arrived: use what arrived
        let mut buf = descriptor(1, "example.com");
        buf[0] = 64;
        assert_eq!(
            decode_url_descriptor(&buf).as_deref(),
            Some("https://example.com")
        );
    }

    #[test]
    fn test_decode_url_short_buffer() {
        assert!(decode_url_descriptor(&[]).is_none());
        assert!(decode_url_descriptor(&[3, 0x03]).is_none());
        assert_eq!(decode_url_descriptor(&[3, 0x03, 1]).as_deref(), Some("https://"));
    }
}
