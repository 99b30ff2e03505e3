//! SDP offer rewrite (§6): the Opus quality workaround shared by the ingest
//! and participant handlers.

/// Strip the `;sprop-maxcapturerate=24000` fmtp token, if present, from every
/// line of an inbound SDP body before it is set as a remote description.
pub fn strip_sprop_maxcapturerate(sdp: &str) -> String {
    sdp.replace(";sprop-maxcapturerate=24000", "")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_token_from_opus_fmtp_line() {
        let offer = "a=fmtp:111 minptime=10;useinbandfec=1;sprop-maxcapturerate=24000\r\n";
        let rewritten = strip_sprop_maxcapturerate(offer);
        assert_eq!(
            rewritten,
            "a=fmtp:111 minptime=10;useinbandfec=1\r\n"
        );
        assert!(!rewritten.contains("sprop-maxcapturerate"));
    }

    #[test]
    fn leaves_sdp_without_token_unchanged() {
        let offer = "a=fmtp:111 minptime=10;useinbandfec=1\r\n";
        assert_eq!(strip_sprop_maxcapturerate(offer), offer);
    }

    #[test]
    fn strips_every_occurrence() {
        let offer = "a=fmtp:111 x;sprop-maxcapturerate=24000\r\na=fmtp:112 y;sprop-maxcapturerate=24000\r\n";
        let rewritten = strip_sprop_maxcapturerate(offer);
        assert!(!rewritten.contains("sprop-maxcapturerate"));
        assert!(rewritten.contains("a=fmtp:111 x"));
        assert!(rewritten.contains("a=fmtp:112 y"));
    }
}
