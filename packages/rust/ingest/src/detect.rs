//! Text encoding and delimiter sniffing for channel exports.

/// Delimiters tried, in tie-break order.
const DELIMITERS: [u8; 3] = [b';', b',', b'\t'];

/// UTF-8 byte order mark.
const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// Decoded file contents plus the encoding that produced them.
#[derive(Debug, Clone)]
pub struct Decoded {
    pub text: String,
    pub encoding: &'static str,
}

/// Decode export bytes: UTF-8 (BOM stripped) when valid, Windows-1251 otherwise.
///
/// Telegram desktop exports opened and re-saved in Excel on Russian-locale
/// systems come out as Windows-1251.
pub fn decode(bytes: &[u8]) -> Decoded {
    let bytes = bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes);

    match std::str::from_utf8(bytes) {
        Ok(text) => Decoded {
            text: text.to_string(),
            encoding: "utf-8",
        },
        Err(_) => {
            let (text, _, _) = encoding_rs::WINDOWS_1251.decode(bytes);
            Decoded {
                text: text.into_owned(),
                encoding: "windows-1251",
            }
        }
    }
}

/// Pick the delimiter that occurs most often in the header line.
///
/// Falls back to `,` when no candidate occurs.
pub fn sniff_delimiter(text: &str) -> u8 {
    let header = text.lines().next().unwrap_or("");

    let mut best = (b',', 0usize);
    for delim in DELIMITERS {
        let count = header.bytes().filter(|b| *b == delim).count();
        if count > best.1 {
            best = (delim, count);
        }
    }
    best.0
}

/// Printable delimiter name for logs.
pub fn delimiter_name(delim: u8) -> &'static str {
    match delim {
        b';' => "semicolon",
        b',' => "comma",
        b'\t' => "tab",
        _ => "other",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_utf8_and_strips_bom() {
        let decoded = decode("\u{feff}text;date\nПривет;2024".as_bytes());
        assert_eq!(decoded.encoding, "utf-8");
        assert!(decoded.text.starts_with("text;date"));
        assert!(decoded.text.contains("Привет"));
    }

    #[test]
    fn falls_back_to_windows_1251() {
        let (bytes, _, _) = encoding_rs::WINDOWS_1251.encode("text;date\nПривет;2024");
        let decoded = decode(&bytes);
        assert_eq!(decoded.encoding, "windows-1251");
        assert!(decoded.text.contains("Привет"));
    }

    #[test]
    fn sniffs_semicolon_comma_and_tab() {
        assert_eq!(sniff_delimiter("text;date;link\na,b;c;d"), b';');
        assert_eq!(sniff_delimiter("text,date,link\n"), b',');
        assert_eq!(sniff_delimiter("text\tdate\tlink\n"), b'\t');
    }

    #[test]
    fn sniff_uses_header_only_and_defaults_to_comma() {
        // Body commas must not outvote the header's semicolons.
        assert_eq!(sniff_delimiter("text;date\nhello, world, again;2024"), b';');
        assert_eq!(sniff_delimiter("text\n"), b',');
        assert_eq!(sniff_delimiter(""), b',');
    }
}
