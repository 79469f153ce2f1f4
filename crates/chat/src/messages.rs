//! Wire types for the protocols spoken by the gateway.
//!
//! The OpenAI Chat Completions format is both the inbound protocol and the
//! shape of the terminal values (finish reason, usage) reported by runtimes.

pub mod openai;
