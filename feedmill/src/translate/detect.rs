/*!
Lightweight language detection used to short-circuit translations whose
input is already in the target language.
*/

use whatlang::{Detector, Lang};

const CONFIDENCE_THRESHOLD: f64 = 0.5;

fn detector() -> &'static Detector {
    static DETECTOR: std::sync::OnceLock<Detector> = std::sync::OnceLock::new();
    DETECTOR.get_or_init(Detector::new)
}

/// Map an API-facing two-letter code onto the detector's language set.
/// Codes the detector cannot represent return None, which disables the
/// short-circuit (the provider will translate anyway).
fn lang_for_code(code: &str) -> Option<Lang> {
    let code = code.split(['-', '_']).next().unwrap_or(code);
    match code.to_lowercase().as_str() {
        "en" => Some(Lang::Eng),
        "zh" => Some(Lang::Cmn),
        "ja" => Some(Lang::Jpn),
        "ko" => Some(Lang::Kor),
        "fr" => Some(Lang::Fra),
        "de" => Some(Lang::Deu),
        "es" => Some(Lang::Spa),
        "pt" => Some(Lang::Por),
        "it" => Some(Lang::Ita),
        "ru" => Some(Lang::Rus),
        "nl" => Some(Lang::Nld),
        "ar" => Some(Lang::Ara),
        "tr" => Some(Lang::Tur),
        "pl" => Some(Lang::Pol),
        "sv" => Some(Lang::Swe),
        "uk" => Some(Lang::Ukr),
        "vi" => Some(Lang::Vie),
        "hi" => Some(Lang::Hin),
        _ => None,
    }
}

/// True when the text is confidently already in the target language.
pub fn already_in_target(text: &str, target_code: &str) -> bool {
    let Some(target) = lang_for_code(target_code) else {
        return false;
    };
    match detector().detect(text) {
        Some(info) => info.lang() == target && info.confidence() >= CONFIDENCE_THRESHOLD,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_matching_language() {
        assert!(already_in_target("你好，这是一段比较长的中文文本，用来测试语言检测。", "zh"));
        assert!(already_in_target(
            "This is a reasonably long English sentence used for detection.",
            "en"
        ));
    }

    #[test]
    fn mismatched_language_does_not_short_circuit() {
        assert!(!already_in_target(
            "This is a reasonably long English sentence used for detection.",
            "zh"
        ));
    }

    #[test]
    fn unknown_target_code_disables_short_circuit() {
        assert!(!already_in_target("whatever text", "xx"));
    }

    #[test]
    fn region_suffixes_are_normalized() {
        assert!(already_in_target("你好，这是一段比较长的中文文本，用来测试语言检测。", "zh-CN"));
    }
}
