//! Display-mode state machine shared by the content blocks.

mod core;

pub use self::core::{
    DisplayController, MODE_INIT, MODE_INSERT, MODE_RESET, MODE_WAIT, ModeDescriptor, ModeTable,
    RegionMarks,
};
