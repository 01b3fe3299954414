//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module   | Commands handled                          |
//! |----------|-------------------------------------------|
//! | `serve`  | `Serve`                                   |
//! | `config` | `Init`, `Config`                          |
//! | `user`   | `User`                                    |
//! | `leads`  | `Leads`                                   |
//! | `chat`   | `Chat`                                    |
//! | `remote` | login shared by `Leads` and `Chat`        |

pub mod chat;
pub mod config;
pub mod leads;
pub mod remote;
pub mod serve;
pub mod user;

pub use chat::cmd_chat;
pub use config::{cmd_config, cmd_init};
pub use leads::cmd_leads;
pub use serve::cmd_serve;
pub use user::cmd_user;
