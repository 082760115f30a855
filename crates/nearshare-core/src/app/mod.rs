//! Channel applications.

pub mod nearshare;
pub mod token;

pub use nearshare::NearShareApp;
pub use token::FileTransferToken;
