pub mod llm;
pub mod openai;
pub mod watsonx;

pub use openai::OpenAIBackend;
pub use watsonx::WatsonxBackend;
