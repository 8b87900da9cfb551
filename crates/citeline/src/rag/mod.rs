pub mod agent;
pub mod citations;
pub mod context;
pub mod prompts;
pub mod response;
pub mod similarity;

pub use agent::{Agent, RawOutput, SectionMeta};
pub use citations::CitationScorer;
pub use context::{format_dependent_sections, format_response, ContextBuilder, SheetsMap};
pub use response::parse_response;
