pub mod icons;
pub mod output;
pub mod table;
pub mod theme;

pub use icons::Icons;
pub use output::{header, info, root_line, section, status, success, summary_row, warn};
pub use table::{roots_table, stats_table, TableBuilder};
pub use theme::{theme, Theme};
