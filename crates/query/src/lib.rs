pub mod error;
pub mod history;
pub mod prompt;
pub mod translator;

pub use error::QueryError;
pub use history::{QueryHistory, QueryTurn, SessionStore};
pub use prompt::NO_ANSWER;
pub use translator::{QueryStage, QueryTranslator, TranslatorConfig, write_clause};
