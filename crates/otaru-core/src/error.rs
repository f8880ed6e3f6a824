pub use otaru_types::error::{OtaruError, Result};
