pub mod convert;
pub mod ocr;

pub use convert::{HttpPdfConverter, PdfConvertApi};
pub use ocr::{HttpOcrClient, OcrApi, OcrLine, OcrPage};
