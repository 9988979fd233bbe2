//! 关键词匹配：器械名称 / 指南标题的相似度打分

use std::collections::BTreeSet;

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "for", "in", "of", "on", "or", "the", "to", "with", "device", "devices",
    "system", "used", "use",
];

/// 小写、去标点、去停用词后的关键词集合
pub fn keywords(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .map(|w| w.to_lowercase())
        .filter(|w| w.len() > 1 && !STOPWORDS.contains(&w.as_str()))
        .collect()
}

/// Dice 系数：2|A∩B| / (|A|+|B|)，取值 [0, 1]
pub fn overlap_score(a: &str, b: &str) -> f64 {
    let ka = keywords(a);
    let kb = keywords(b);
    if ka.is_empty() || kb.is_empty() {
        return 0.0;
    }
    let shared = ka.intersection(&kb).count() as f64;
    2.0 * shared / (ka.len() + kb.len()) as f64
}

/// 保留两位小数并夹到 [0, 1]
pub fn round_score(value: f64) -> f64 {
    ((value.clamp(0.0, 1.0)) * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keywords_drop_stopwords() {
        let k = keywords("The Cardiac Monitor, for use in ICU");
        assert!(k.contains("cardiac"));
        assert!(k.contains("icu"));
        assert!(!k.contains("the"));
        assert!(!k.contains("use"));
    }

    #[test]
    fn test_overlap_score() {
        assert_eq!(overlap_score("cardiac monitor", "Monitor, Cardiac"), 1.0);
        assert_eq!(overlap_score("cardiac monitor", "infusion pump"), 0.0);
        let partial = overlap_score("cardiac monitor", "cardiac catheter");
        assert!(partial > 0.0 && partial < 1.0);
        assert_eq!(overlap_score("", "pump"), 0.0);
    }

    #[test]
    fn test_round_score() {
        assert_eq!(round_score(0.8765), 0.88);
        assert_eq!(round_score(1.7), 1.0);
        assert_eq!(round_score(-0.2), 0.0);
    }
}
