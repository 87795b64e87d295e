use std::ascii;

/// Renders arbitrary bytes as printable ASCII for logging.
pub fn bytes_to_human_str(input: &[u8]) -> String {
    input
        .iter()
        .flat_map(|&c| ascii::escape_default(c))
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_to_human_str() {
        assert_eq!(bytes_to_human_str(b"ADDJOB q"), "ADDJOB q");
        assert_eq!(bytes_to_human_str(b"a\r\n\x00\xff"), "a\\r\\n\\x00\\xff");
    }
}
