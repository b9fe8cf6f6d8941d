/// Accumulates `iptables-restore` input. Transactions without any lines are
/// dropped so a no-op update produces no input at all.
#[derive(Debug, Default)]
pub struct RestoreInputBuilder {
    buf: String,
    current_table: Option<String>,
    table_written: bool,
    lines_written: usize,
}

impl RestoreInputBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_transaction(&mut self, table: &str) {
        assert!(
            self.current_table.is_none(),
            "start_transaction called inside a transaction"
        );
        self.current_table = Some(table.to_owned());
        self.table_written = false;
    }

    pub fn end_transaction(&mut self) {
        assert!(
            self.current_table.is_some(),
            "end_transaction called outside a transaction"
        );
        if self.table_written {
            self.buf.push_str("COMMIT\n");
        }
        self.current_table = None;
        self.table_written = false;
    }

    /// Declares the chain, creating it if absent and flushing it otherwise.
    pub fn write_forward_reference(&mut self, chain: &str) {
        self.write_line(&format!(":{chain} - -"));
    }

    pub fn write_line(&mut self, line: &str) {
        if !self.table_written {
            if let Some(table) = &self.current_table {
                self.buf.push('*');
                self.buf.push_str(table);
                self.buf.push('\n');
                self.table_written = true;
            }
        }
        self.buf.push_str(line);
        self.buf.push('\n');
        self.lines_written += 1;
    }

    pub fn is_empty(&self) -> bool {
        self.lines_written == 0
    }

    pub fn lines_written(&self) -> usize {
        self.lines_written
    }

    pub fn as_str(&self) -> &str {
        &self.buf
    }

    pub fn reset(&mut self) {
        self.buf.clear();
        self.current_table = None;
        self.table_written = false;
        self.lines_written = 0;
    }
}
