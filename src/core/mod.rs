pub mod chunker;
pub mod context;
pub mod engine;
pub mod parser;
pub mod prompt;
pub mod scan;
pub mod suggestion;

pub use chunker::{Chunker, TextChunks};
pub use context::{AnalysisContext, AnalysisKind, FileEntry, FileKind};
pub use engine::SuggestionEngine;
pub use parser::{parse_suggestions, ParsedSuggestion};
pub use prompt::PromptBuilder;
pub use scan::{AdapterSource, ScanOrchestrator, ScanRecord, ScanStatus};
pub use suggestion::{apply_suggestion, Impact, SuggestionDetails, SuggestionRecord, SuggestionStatus};
