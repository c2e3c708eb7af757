pub mod config;
pub mod content;
pub mod marketplace;

pub use content::WbContentClient;
pub use marketplace::WbMarketplaceClient;
