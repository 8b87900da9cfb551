pub mod chunker;
pub mod parser;

pub use chunker::Chunker;
pub use parser::{col_letter, col_number, is_table_file, DocumentParser, Page, Parsed, SheetData};
