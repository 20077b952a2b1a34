pub mod show_attend_tell;
pub mod with_tracing;
