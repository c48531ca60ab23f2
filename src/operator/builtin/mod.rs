//! Built-in operators: the statically enumerated set the registry is
//! populated with at startup.
//!
//! One operator per kind in the base taxonomy:
//! - `emoji-strip`, `whitespace-normalize` (mappers)
//! - `min-length-filter` (filter)
//! - `segmenter` (slicer)
//! - `qa-scorer` (llm-evaluator)
//! - `text-export` (formatter)

mod emoji_strip;
mod min_length;
mod qa_scorer;
mod segmenter;
mod text_export;
mod whitespace;

pub use emoji_strip::EmojiStrip;
pub use min_length::MinLengthFilter;
pub use qa_scorer::QaScorer;
pub use segmenter::Segmenter;
pub use text_export::TextExport;
pub use whitespace::WhitespaceNormalize;

use super::registry::OperatorDescriptor;
use super::OperatorKind;

/// The enumerated startup list.
pub fn descriptors() -> Vec<OperatorDescriptor> {
    vec![
        OperatorDescriptor {
            name: EmojiStrip::NAME,
            kind: OperatorKind::Mapper,
            factory: emoji_strip::factory,
        },
        OperatorDescriptor {
            name: WhitespaceNormalize::NAME,
            kind: OperatorKind::Mapper,
            factory: whitespace::factory,
        },
        OperatorDescriptor {
            name: MinLengthFilter::NAME,
            kind: OperatorKind::Filter,
            factory: min_length::factory,
        },
        OperatorDescriptor {
            name: Segmenter::NAME,
            kind: OperatorKind::Slicer,
            factory: segmenter::factory,
        },
        OperatorDescriptor {
            name: QaScorer::NAME,
            kind: OperatorKind::LlmEvaluator,
            factory: qa_scorer::factory,
        },
        OperatorDescriptor {
            name: TextExport::NAME,
            kind: OperatorKind::Formatter,
            factory: text_export::factory,
        },
    ]
}
