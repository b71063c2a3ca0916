use crate::application::portal::BalanceRow;
use crate::error::Result;
use std::io::Write;

/// Writes the final `user,balance,entries` report as CSV.
pub struct BalanceWriter<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write> BalanceWriter<W> {
    pub fn new(sink: W) -> Self {
        Self {
            writer: csv::Writer::from_writer(sink),
        }
    }

    /// Writes a header even when there are no rows.
    pub fn write_balances(&mut self, rows: &[BalanceRow]) -> Result<()> {
        if rows.is_empty() {
            self.writer.write_record(["user", "balance", "entries"])?;
        }
        for row in rows {
            self.writer.serialize(row)?;
        }
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_writes_header_and_rows() {
        let mut out = Vec::new();
        BalanceWriter::new(&mut out)
            .write_balances(&[
                BalanceRow {
                    user: 1,
                    balance: 150,
                    entries: 2,
                },
                BalanceRow {
                    user: 2,
                    balance: 0,
                    entries: 0,
                },
            ])
            .unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "user,balance,entries\n1,150,2\n2,0,0\n"
        );
    }

    #[test]
    fn test_empty_report_has_header() {
        let mut out = Vec::new();
        BalanceWriter::new(&mut out).write_balances(&[]).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "user,balance,entries\n");
    }
}
