//! Building blocks for [`clap`]-driven configuration of the tab vault.

pub mod logging;
pub mod storage;
