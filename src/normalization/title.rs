use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

/// Whether a code point belongs to an emoji or pictographic block.
///
/// Covers the emoji planes plus the BMP symbol blocks storefront editors tend
/// to paste into titles, and the joiners/selectors that glue emoji sequences.
pub fn is_pictographic(c: char) -> bool {
    matches!(c as u32,
        0x1F000..=0x1FAFF      // mahjong, cards, enclosed supplements, pictographs, emoticons, transport, ext-A
        | 0x2600..=0x27BF      // misc symbols, dingbats
        | 0x2300..=0x23FF      // misc technical (watch, hourglass, ...)
        | 0x2B00..=0x2BFF      // misc symbols and arrows (stars, squares)
        | 0x2190..=0x21FF      // arrows
        | 0x3030 | 0x303D | 0x3297 | 0x3299
        | 0x00A9 | 0x00AE | 0x2122 | 0x2139
        | 0x200D               // zero width joiner
        | 0x20E3               // combining enclosing keycap
        | 0xFE00..=0xFE0F      // variation selectors
        | 0xE0020..=0xE007F    // tag sequences
    )
}

/// Strip emoji and pictographs, then trim surrounding whitespace.
pub fn clean_title(raw: &str) -> String {
    let stripped: String = raw.chars().filter(|c| !is_pictographic(*c)).collect();
    stripped.trim().to_string()
}

/// URL handle derived from a title: accents folded, then lowercase ASCII
/// alphanumerics joined by `-`.
pub fn handleize(title: &str) -> String {
    let mut out = String::with_capacity(title.len());
    let mut pending_dash = false;
    let cleaned = clean_title(title);
    for ch in cleaned.nfd().filter(|c| !is_combining_mark(*c)) {
        if ch.is_ascii_alphanumeric() {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.push(ch.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_emoji_and_trims() {
        assert_eq!(clean_title("  Lamp 💡 "), "Lamp");
        assert_eq!(clean_title("🔥 Sale ⭐ Chair"), "Sale  Chair");
        assert_eq!(clean_title("Family 👨‍👩‍👧 Pack"), "Family  Pack");
        assert_eq!(clean_title("❤️"), "");
    }

    #[test]
    fn keeps_accented_and_cjk_text() {
        assert_eq!(clean_title("Camiseta Niño"), "Camiseta Niño");
        assert_eq!(clean_title("椅子"), "椅子");
    }

    #[test]
    fn handleize_collapses_separators() {
        assert_eq!(handleize("Home & Garden 🌿"), "home-garden");
        assert_eq!(handleize("Summer--Sale"), "summer-sale");
    }

    #[test]
    fn handleize_folds_accents() {
        assert_eq!(handleize("  Lámparas de Mesa "), "lamparas-de-mesa");
        assert_eq!(handleize("Camiseta Niño"), "camiseta-nino");
        assert_eq!(handleize("Décoration Intérieure"), "decoration-interieure");
        assert_eq!(handleize("椅子"), "");
    }
}
