pub mod extractor;
pub mod transport;

#[cfg(feature = "browser")]
pub mod browser;

#[cfg(feature = "browser")]
pub use browser::BrowserPageSource;
pub use extractor::{SelectorExtractor, extract_html};
pub use transport::ReqwestTransport;
