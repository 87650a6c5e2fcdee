use crate::error::{EscrowError, Result};
use serde::Deserialize;
use std::fmt;
use std::io::Read;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Op {
    /// Publishes a package: `package`, `actor` (provider), optional `amount`
    /// (delivery days) and `note` (title).
    Package,
    Create,
    Accept,
    Start,
    Deliver,
    Approve,
    Revise,
    Dispute,
    /// `note` is `refund` or `complete`.
    Resolve,
    Cancel,
    /// Runs the payout scheduler.
    Payout,
    /// Hands requested payouts to the gateway.
    Dispatch,
    /// Reports the provider's open payout; `note` is `paid` or `failed`.
    Settle,
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// One input row: `op, order, actor, package, amount, key, note`.
///
/// `order` is a label chosen by the file author; the replayer maps it to the
/// generated order id.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CommandRecord {
    pub op: Op,
    pub order: Option<String>,
    pub actor: Option<String>,
    pub package: Option<String>,
    pub amount: Option<i64>,
    pub key: Option<String>,
    pub note: Option<String>,
}

/// Reads commands from a CSV source, trimming whitespace and tolerating
/// short rows.
pub struct CommandReader<R: Read> {
    reader: csv::Reader<R>,
}

impl<R: Read> CommandReader<R> {
    pub fn new(source: R) -> Self {
        let reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(source);
        Self { reader }
    }

    /// Lazily deserializes the rows.
    pub fn commands(self) -> impl Iterator<Item = Result<CommandRecord>> {
        self.reader
            .into_deserialize()
            .map(|result| result.map_err(EscrowError::from))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reader_valid_stream() {
        let data = "op, order, actor, package, amount, key, note\n\
                    create, o1, cust-1, pkg-1, 10000, checkout-1,\n\
                    deliver, o1, prov-1, , , , s3://bucket/file";
        let commands: Vec<Result<CommandRecord>> = CommandReader::new(data.as_bytes()).commands().collect();

        assert_eq!(commands.len(), 2);
        let create = commands[0].as_ref().unwrap();
        assert_eq!(create.op, Op::Create);
        assert_eq!(create.amount, Some(10_000));
        assert_eq!(create.key.as_deref(), Some("checkout-1"));
        assert_eq!(create.note, None);

        let deliver = commands[1].as_ref().unwrap();
        assert_eq!(deliver.package, None);
        assert_eq!(deliver.note.as_deref(), Some("s3://bucket/file"));
    }

    #[test]
    fn test_reader_short_row() {
        let data = "op, order, actor, package, amount, key, note\npayout";
        let commands: Vec<Result<CommandRecord>> = CommandReader::new(data.as_bytes()).commands().collect();
        assert_eq!(commands[0].as_ref().unwrap().op, Op::Payout);
    }

    #[test]
    fn test_reader_malformed_line() {
        let data = "op, order, actor, package, amount, key, note\nrefund, o1, cust-1, , abc, ,";
        let commands: Vec<Result<CommandRecord>> = CommandReader::new(data.as_bytes()).commands().collect();
        assert!(commands[0].is_err());
    }
}
