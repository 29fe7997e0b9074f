//! Resume PDF export: a typed resume schema plus the workflow that renders the
//! preview site's resume page to `public/cv.pdf` with a headless browser.

pub mod browser;
pub mod config;
pub mod errors;
pub mod export;
pub mod models;
pub mod server;
