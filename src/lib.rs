//! BotWave: synchronized FM broadcasting across a fleet of single-board
//! computers.
//!
//! This root crate only anchors the cross-service integration suites under
//! `tests/integration/`; the real code lives in the workspace members:
//!
//! - `bw-protocol` — control-channel frame grammar and shared wire types
//! - `bw-core` — filename hygiene, handler scripts, queue state, TLS material
//! - `bw-backend` — transmitter and PCM-source seams
//! - `services/server` — fleet controller
//! - `services/client` — transmitter client runtime
