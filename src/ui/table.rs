use crate::oid::Oid;
use crate::storage::StoreStats;
use tabled::{settings::Style, Table, Tabled};

#[derive(Tabled)]
pub struct TableRow {
    #[tabled(rename = "Metric")]
    pub metric: String,
    #[tabled(rename = "Value")]
    pub value: String,
}

#[derive(Tabled)]
pub struct RootRow {
    #[tabled(rename = "Root")]
    pub name: String,
    #[tabled(rename = "Oid")]
    pub oid: String,
}

#[derive(Default)]
pub struct TableBuilder {
    rows: Vec<TableRow>,
}

impl TableBuilder {
    pub fn new() -> Self {
        Self { rows: Vec::new() }
    }

    pub fn add_row(&mut self, label: &str, value: &str) {
        self.rows.push(TableRow {
            metric: label.to_string(),
            value: value.to_string(),
        });
    }

    pub fn build(&self) -> String {
        if self.rows.is_empty() {
            return String::new();
        }

        Table::new(&self.rows).with(Style::rounded()).to_string()
    }
}

pub fn stats_table(stats: &StoreStats) -> String {
    let mut builder = TableBuilder::new();
    builder.add_row("Oids", &stats.oids.to_string());
    builder.add_row("Literals", &stats.literals.to_string());
    builder.add_row("Edges", &stats.edges.to_string());
    builder.add_row("Weakrefs", &stats.weakrefs.to_string());
    builder.add_row("Externals", &stats.externals.to_string());
    builder.add_row("Roots", &stats.roots.to_string());
    builder.add_row("Sessions", &stats.sessions.to_string());
    builder.add_row("Next oid", &stats.next_oid.to_string());
    builder.build()
}

pub fn roots_table(roots: &[(String, Oid)]) -> String {
    if roots.is_empty() {
        return String::new();
    }
    let rows: Vec<RootRow> = roots
        .iter()
        .map(|(name, oid)| RootRow {
            name: name.clone(),
            oid: oid.to_string(),
        })
        .collect();
    Table::new(&rows).with(Style::rounded()).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_tables_render_nothing() {
        assert!(TableBuilder::new().build().is_empty());
        assert!(roots_table(&[]).is_empty());
    }

    #[test]
    fn test_roots_table_lists_names() {
        let table = roots_table(&[("doc".to_string(), Oid(1004))]);
        assert!(table.contains("doc"));
        assert!(table.contains("@1004"));
        assert!(table.contains("Root"));
    }
}
