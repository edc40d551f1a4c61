use serde::Serialize;
use tabled::Tabled;

/// Output format for CLI commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
}

impl OutputFormat {
    /// Parse from CLI string argument.
    pub fn from_str_arg(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "json" => Self::Json,
            _ => Self::Table,
        }
    }
}

/// Render rows as a table or a JSON array.
pub fn render_list<T: Serialize + Tabled>(items: &[T], format: OutputFormat) {
    match format {
        OutputFormat::Table => println!("{}", table(items)),
        OutputFormat::Json => render_json(items),
    }
}

/// Pretty-print any serializable value as JSON.
pub fn render_json<T: Serialize + ?Sized>(value: &T) {
    println!("{}", serde_json::to_string_pretty(value).unwrap_or_default());
}

fn table<T: Tabled>(items: &[T]) -> String {
    if items.is_empty() {
        return "(none)".to_string();
    }
    tabled::Table::new(items)
        .with(tabled::settings::Style::rounded())
        .to_string()
}
