use std::io::{BufWriter, Write};
use std::path::Path;

/// Whitespace separated numeric table with a `#` header naming the columns.
///
/// Every output of the analysis is one of these so that any plotting tool can read it.
#[derive(Debug, Clone, PartialEq)]
pub struct DataTable {
    name: String,
    columns: Vec<String>,
    rows: Vec<Vec<f64>>,
}

impl DataTable {
    pub fn new(name: &str, columns: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<f64>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Add a row. Rows of the wrong width are dropped with a warning.
    pub fn push(&mut self, row: Vec<f64>) {
        if row.len() != self.columns.len() {
            spdlog::warn!(
                "Dropping row of {} values from table {} which has {} columns",
                row.len(),
                self.name,
                self.columns.len()
            );
            return;
        }
        self.rows.push(row);
    }

    pub fn extend(&mut self, rows: impl IntoIterator<Item = Vec<f64>>) {
        for row in rows {
            self.push(row);
        }
    }

    /// Write the table to `<dir>/<name>.txt`
    pub fn write_to_dir(&self, dir: &Path) -> Result<(), std::io::Error> {
        self.write(&dir.join(format!("{}.txt", self.name)))
    }

    pub fn write(&self, path: &Path) -> Result<(), std::io::Error> {
        let mut writer = BufWriter::new(std::fs::File::create(path)?);
        writeln!(writer, "# {}", self.columns.join(" "))?;
        for row in self.rows.iter() {
            let values: Vec<String> = row.iter().map(|v| v.to_string()).collect();
            writeln!(writer, "{}", values.join(" "))?;
        }
        writer.flush()?;
        spdlog::info!("Wrote {} rows to {}", self.rows.len(), path.to_string_lossy());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_table() {
        let mut table = DataTable::new("hvcalib_table_test", &["time_ms", "mirror", "hv"]);
        table.push(vec![1_250_000_000_123.0, 6.0, 1000.5]);
        table.push(vec![1.0]);
        assert_eq!(table.len(), 1);

        let dir = std::env::temp_dir();
        table.write_to_dir(&dir).unwrap();
        let text = std::fs::read_to_string(dir.join("hvcalib_table_test.txt")).unwrap();
        assert_eq!(text, "# time_ms mirror hv\n1250000000123 6 1000.5\n");
    }
}
