//! Category codes and label derivation.

use std::fmt;

use serde::{Serialize, Serializer};

use super::normalize::AnalysisRecord;

/// Moderation flag codes, declared in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Category {
    T1,
    T2,
    W1,
    H1,
    N1,
    B1,
    BR,
    CP,
    PL,
    PP,
}

impl Category {
    pub const ALL: [Category; 10] = [
        Category::T1,
        Category::T2,
        Category::W1,
        Category::H1,
        Category::N1,
        Category::B1,
        Category::BR,
        Category::CP,
        Category::PL,
        Category::PP,
    ];

    pub fn code(self) -> &'static str {
        match self {
            Category::T1 => "T1",
            Category::T2 => "T2",
            Category::W1 => "W1",
            Category::H1 => "H1",
            Category::N1 => "N1",
            Category::B1 => "B1",
            Category::BR => "BR",
            Category::CP => "CP",
            Category::PL => "PL",
            Category::PP => "PP",
        }
    }

    /// Whether this flag alone is benign enough to collapse to a single code.
    fn is_soft(self) -> bool {
        matches!(self, Category::H1 | Category::T1)
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Final verdict label as persisted in `auto_review_status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Label {
    Good,
    Error,
    Flags(Vec<Category>),
}

impl Label {
    pub fn is_error(&self) -> bool {
        matches!(self, Label::Error)
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Label::Good => f.write_str("good"),
            Label::Error => f.write_str("error"),
            Label::Flags(codes) => {
                for (i, code) in codes.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    f.write_str(code.code())?;
                }
                Ok(())
            }
        }
    }
}

impl Serialize for Label {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Raw flags raised by a record, in enumeration order.
///
/// Text codes only count when the model reports text at all; both T1 and T2
/// may be raised together.
pub fn collect_flags(record: &AnalysisRecord) -> Vec<Category> {
    let text = &record.text_analysis;
    let checks = [
        (Category::T1, record.text_present && text.correct_spelling),
        (Category::T2, record.text_present && text.has_spelling_errors),
        (Category::W1, record.watermark_present),
        (Category::H1, record.contains_humans),
        (Category::N1, record.contains_nudity),
        (Category::B1, record.contains_blood_violence),
        (Category::BR, record.contains_brands),
        (Category::CP, record.copyright_content),
        (Category::PL, record.recognizable_places),
        (Category::PP, record.recognizable_people),
    ];

    checks
        .into_iter()
        .filter_map(|(code, raised)| raised.then_some(code))
        .collect()
}

/// Collapse the raw flags to the persisted label.
///
/// A flag set made only of H1/T1 reduces to one code (H1 wins). Any other
/// flag keeps the whole list, H1 and T1 included.
pub fn derive_label(record: &AnalysisRecord) -> Label {
    let flags = collect_flags(record);

    if flags.is_empty() {
        return Label::Good;
    }
    if flags.iter().all(|c| c.is_soft()) {
        let code = if flags.contains(&Category::H1) {
            Category::H1
        } else {
            Category::T1
        };
        return Label::Flags(vec![code]);
    }
    Label::Flags(flags)
}
