use super::csv::command_reader::{CommandRecord, Op};
use crate::application::marketplace::Marketplace;
use crate::application::orders::{DisputeOutcome, NewOrder, Request};
use crate::domain::actor::{Actor, UserId};
use crate::domain::order::{Order, OrderId};
use crate::domain::package::{PackageId, ServicePackage};
use crate::domain::payout::PayoutOutcome;
use crate::domain::ports::PackageCatalog;
use crate::domain::wallet::WalletId;
use crate::error::{EscrowError, Result};
use crate::infrastructure::gateway::RecordingGateway;
use crate::infrastructure::in_memory::InMemoryPackageCatalog;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Applies command rows in file order.
///
/// Order labels and published packages live only for one replay; balances
/// persist with the stores behind the marketplace.
pub struct CommandReplayer {
    marketplace: Marketplace,
    catalog: Arc<InMemoryPackageCatalog>,
    gateway: RecordingGateway,
    orders: HashMap<String, OrderId>,
}

impl CommandReplayer {
    pub fn new(marketplace: Marketplace, catalog: Arc<InMemoryPackageCatalog>) -> Self {
        Self {
            marketplace,
            catalog,
            gateway: RecordingGateway::new(),
            orders: HashMap::new(),
        }
    }

    pub fn marketplace(&self) -> &Marketplace {
        &self.marketplace
    }

    /// The order id behind a label, once `create` succeeded for it.
    pub fn order(&self, label: &str) -> Option<OrderId> {
        self.orders.get(label).copied()
    }

    pub async fn apply(&mut self, command: CommandRecord) -> Result<()> {
        debug!(op = %command.op, order = ?command.order, "applying command");

        match command.op {
            Op::Package => self.publish(&command).await?,
            Op::Create => self.create(&command).await?,
            Op::Accept => {
                let (id, request) = self.order_request(&command).await?;
                self.marketplace.orders.accept(&request, id).await?;
            }
            Op::Start => {
                let (id, request) = self.order_request(&command).await?;
                self.marketplace.orders.start(&request, id).await?;
            }
            Op::Deliver => {
                let (id, request) = self.order_request(&command).await?;
                let deliverable = command.note.clone().unwrap_or_default();
                self.marketplace.orders.deliver(&request, id, deliverable).await?;
            }
            Op::Approve => {
                let (id, request) = self.order_request(&command).await?;
                self.marketplace.orders.approve(&request, id).await?;
            }
            Op::Revise => {
                let (id, request) = self.order_request(&command).await?;
                self.marketplace.orders.request_revision(&request, id, command.note.clone()).await?;
            }
            Op::Dispute => {
                let (id, request) = self.order_request(&command).await?;
                self.marketplace.orders.dispute(&request, id, command.note.clone()).await?;
            }
            Op::Resolve => {
                let id = self.order_id(&command)?;
                let outcome = match required(&command.note, "note")? {
                    "refund" => DisputeOutcome::Refund,
                    "complete" => DisputeOutcome::Complete,
                    other => {
                        return Err(EscrowError::ValidationError(format!(
                            "unknown dispute outcome {other:?}"
                        )));
                    }
                };
                let admin = Actor::admin(required(&command.actor, "actor")?);
                self.marketplace
                    .orders
                    .resolve_dispute(&request(admin, &command), id, outcome)
                    .await?;
            }
            Op::Cancel => {
                let (id, request) = self.order_request(&command).await?;
                self.marketplace.orders.cancel(&request, id).await?;
            }
            Op::Payout => {
                let run = self.marketplace.payouts.run(Utc::now()).await?;
                info!(created = run.created.len(), skipped = run.skipped.len(), "payout run finished");
            }
            Op::Dispatch => {
                let dispatched = self.marketplace.payouts.dispatch(&self.gateway).await?;
                info!(dispatched = dispatched.len(), "payouts dispatched");
            }
            Op::Settle => self.settle(&command).await?,
        }
        Ok(())
    }

    async fn publish(&self, command: &CommandRecord) -> Result<()> {
        let id = required(&command.package, "package")?;
        let provider = required(&command.actor, "actor")?;

        let mut package = ServicePackage::new(id, provider);
        if let Some(days) = command.amount {
            let days = u32::try_from(days).map_err(|_| {
                EscrowError::ValidationError(format!("invalid delivery days {days}"))
            })?;
            package = package.with_delivery_days(days);
        }
        if let Some(title) = &command.note {
            package.title = title.clone();
        }
        self.catalog.add(package).await;
        Ok(())
    }

    async fn create(&mut self, command: &CommandRecord) -> Result<()> {
        let label = required(&command.order, "order")?;
        if command.key.is_none() && self.orders.contains_key(label) {
            return Err(EscrowError::ValidationError(format!(
                "order label {label} is already used"
            )));
        }
        let customer = required(&command.actor, "actor")?;
        let package = PackageId::new(required(&command.package, "package")?);
        let price = command
            .amount
            .ok_or_else(|| EscrowError::ValidationError("create needs an amount".to_string()))?;

        // an unknown package is rejected by the state machine
        let provider = self
            .catalog
            .package(&package)
            .await?
            .map(|package| package.provider)
            .unwrap_or_else(|| UserId::new(""));

        let order = self
            .marketplace
            .orders
            .create(
                &request(Actor::customer(customer), command),
                NewOrder {
                    customer: UserId::new(customer),
                    provider,
                    package,
                    price,
                },
            )
            .await?;
        self.orders.insert(label.to_string(), order.id);
        Ok(())
    }

    async fn settle(&self, command: &CommandRecord) -> Result<()> {
        let outcome = match required(&command.note, "note")? {
            "paid" => PayoutOutcome::Paid { reference: None },
            "failed" => PayoutOutcome::Failed {
                reason: "reported failed".to_string(),
            },
            other => {
                return Err(EscrowError::ValidationError(format!(
                    "unknown payout outcome {other:?}"
                )));
            }
        };
        let wallet = WalletId::for_provider(&UserId::new(required(&command.actor, "actor")?));

        let payouts = &self.marketplace.payouts;
        let payout = payouts
            .payouts_for(&wallet)
            .await?
            .into_iter()
            .rev()
            .find(|payout| payout.status.is_open())
            .ok_or_else(|| EscrowError::not_found("open payout for wallet", &wallet))?;
        payouts.report(payout.id, outcome).await?;
        Ok(())
    }

    fn order_id(&self, command: &CommandRecord) -> Result<OrderId> {
        let label = required(&command.order, "order")?;
        self.order(label)
            .ok_or_else(|| EscrowError::not_found("order label", label))
    }

    /// Resolves the order label and infers the actor's role from the order.
    async fn order_request(&self, command: &CommandRecord) -> Result<(OrderId, Request)> {
        let id = self.order_id(command)?;
        let order = self.marketplace.orders.get(id).await?;
        let actor = party_of(&order, required(&command.actor, "actor")?);
        Ok((id, request(actor, command)))
    }
}

fn party_of(order: &Order, actor: &str) -> Actor {
    if order.provider.as_str() == actor {
        Actor::provider(actor)
    } else {
        Actor::customer(actor)
    }
}

fn request(actor: Actor, command: &CommandRecord) -> Request {
    match &command.key {
        Some(key) => Request::new(actor).with_key(key.as_str()),
        None => Request::new(actor),
    }
}

fn required<'a>(field: &'a Option<String>, name: &str) -> Result<&'a str> {
    field
        .as_deref()
        .filter(|value| !value.is_empty())
        .ok_or_else(|| EscrowError::ValidationError(format!("missing {name}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::marketplace::Stores;
    use crate::config::Settings;
    use crate::domain::money::Money;
    use crate::domain::order::OrderStatus;
    use crate::interfaces::csv::command_reader::CommandReader;

    fn replayer() -> CommandReplayer {
        let catalog = Arc::new(InMemoryPackageCatalog::new());
        let marketplace = Marketplace::new(Stores::in_memory(), catalog.clone(), &Settings::default());
        CommandReplayer::new(marketplace, catalog)
    }

    async fn run(replayer: &mut CommandReplayer, csv: &str) -> Vec<EscrowError> {
        let mut errors = Vec::new();
        for command in CommandReader::new(csv.as_bytes()).commands() {
            if let Err(e) = replayer.apply(command.unwrap()).await {
                errors.push(e);
            }
        }
        errors
    }

    #[tokio::test]
    async fn test_happy_path_and_payout() {
        let mut replayer = replayer();
        let errors = run(
            &mut replayer,
            "op,order,actor,package,amount,key,note\n\
             package,,prov-1,logo,5,,Logo design\n\
             create,o1,cust-1,logo,20000,,\n\
             accept,o1,prov-1,,,,\n\
             deliver,o1,prov-1,,,,s3://logo.png\n\
             approve,o1,cust-1,,,,\n\
             payout,,,,,,\n\
             dispatch,,,,,,\n\
             settle,,prov-1,,,,paid\n",
        )
        .await;
        assert!(errors.is_empty(), "{errors:?}");

        let id = replayer.order("o1").unwrap();
        let order = replayer.marketplace().orders.get(id).await.unwrap();
        assert_eq!(order.status, OrderStatus::Completed);

        let wallet = WalletId::for_provider(&UserId::new("prov-1"));
        let balance = replayer.marketplace().ledger.balance(&wallet).await.unwrap();
        assert_eq!(balance.total(), Money::ZERO);
    }

    #[tokio::test]
    async fn test_bad_rows_do_not_stop_replay() {
        let mut replayer = replayer();
        let errors = run(
            &mut replayer,
            "op,order,actor,package,amount,key,note\n\
             package,,prov-1,logo,,,\n\
             create,o1,cust-1,logo,5000,,\n\
             approve,o1,cust-1,,,,\n\
             accept,o1,prov-2,,,,\n\
             resolve,o1,ops,,,,maybe\n\
             cancel,o1,cust-1,,,,\n",
        )
        .await;

        assert_eq!(errors.len(), 3);
        let id = replayer.order("o1").unwrap();
        let order = replayer.marketplace().orders.get(id).await.unwrap();
        assert_eq!(order.status, OrderStatus::Cancelled);
    }
}
