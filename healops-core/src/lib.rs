pub mod prompt;
pub mod providers;
pub mod retrieval;

pub use prompt::{
    build_user_prompt, format_similar_fixes, parse_proposal, system_prompt, FixPromptInput,
    ParsedProposal, RAW_FALLBACK_CAP, SECTION_CAP,
};
pub use providers::{
    build_chat_client, AnthropicClient, ChatClient, ChatRequest, ChatResponse, ClientFamily,
    OpenAiCompatClient, ProviderKind,
};
pub use retrieval::{InMemoryRetrieval, MemoryDocument, Retrieval, RetrievedChunk};
