//! Utility functions for common operations.
//!
//! - **Callback validation**: keeps WebSub callbacks from pointing back at
//!   this service or at localhost
//! - **Text helpers**: public id generation and attachment filename
//!   sanitization

mod text;
mod url_validator;

pub use text::{
    preformatted, random_id, random_token, sanitize_filename, PUBLIC_ID_LEN, UNTITLED_FILENAME,
};
pub use url_validator::{validate_callback, CallbackError};
