use crate::domain::wallet::Wallet;
use crate::error::Result;
use serde::Serialize;
use std::io::Write;

#[derive(Serialize)]
struct WalletRow<'a> {
    wallet: &'a str,
    available: i64,
    pending: i64,
    total: i64,
    currency: &'a str,
}

/// Writes wallet balances as `wallet,available,pending,total,currency`,
/// amounts in minor units.
pub struct WalletWriter<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write> WalletWriter<W> {
    pub fn new(sink: W) -> Self {
        Self {
            writer: csv::Writer::from_writer(sink),
        }
    }

    pub fn write_wallets(&mut self, wallets: impl IntoIterator<Item = Wallet>) -> Result<()> {
        let mut written = false;
        for wallet in wallets {
            self.writer.serialize(WalletRow {
                wallet: wallet.id.as_str(),
                available: wallet.available.minor_units(),
                pending: wallet.pending.minor_units(),
                total: wallet.total().minor_units(),
                currency: &wallet.currency,
            })?;
            written = true;
        }
        if !written {
            self.writer
                .write_record(["wallet", "available", "pending", "total", "currency"])?;
        }
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::actor::UserId;
    use crate::domain::money::Amount;
    use crate::domain::order::OrderId;
    use crate::domain::transaction::NewTransaction;
    use crate::domain::wallet::WalletId;
    use chrono::Utc;

    #[test]
    fn test_writes_header_and_rows() {
        let id = WalletId::for_provider(&UserId::new("prov-1"));
        let mut wallet = Wallet::new(id.clone(), "USD");
        let charge = NewTransaction::charge(id, OrderId::new(), Amount::new(2_500).unwrap());
        wallet.apply(&charge, Utc::now()).unwrap();

        let mut out = Vec::new();
        WalletWriter::new(&mut out).write_wallets([wallet]).unwrap();

        let text = String::from_utf8(out).unwrap();
        assert_eq!(
            text,
            "wallet,available,pending,total,currency\nprov-1,0,2500,2500,USD\n"
        );
    }

    #[test]
    fn test_empty_output_still_has_header() {
        let mut out = Vec::new();
        WalletWriter::new(&mut out).write_wallets(Vec::new()).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "wallet,available,pending,total,currency\n"
        );
    }
}
