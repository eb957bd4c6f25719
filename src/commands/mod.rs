pub mod align;
pub mod show_table;

pub use align::align;
pub use show_table::show_table;
