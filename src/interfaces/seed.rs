//! JSON seed data: accounts, orders, tasks and invites to start a replay from.

use crate::application::portal::Portal;
use crate::domain::ids::{Tokens, UserId};
use crate::domain::money::Amount;
use crate::domain::order::PaymentMethod;
use crate::domain::task::RewardTask;
use crate::error::Result;
use serde::Deserialize;
use std::io::Read;
use tracing::info;

#[derive(Debug, Deserialize)]
pub struct SeedOrder {
    pub user: UserId,
    pub amount: Amount,
    pub tokens: Tokens,
    #[serde(default = "default_method")]
    pub method: PaymentMethod,
}

fn default_method() -> PaymentMethod {
    PaymentMethod::Wechat
}

#[derive(Debug, Deserialize)]
pub struct SeedInvite {
    pub inviter: UserId,
    pub invitee: UserId,
    pub reward: Tokens,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Seed {
    pub users: Vec<UserId>,
    /// Created in file order; a fresh store numbers them from 1.
    pub orders: Vec<SeedOrder>,
    pub tasks: Vec<RewardTask>,
    pub invites: Vec<SeedInvite>,
}

impl Seed {
    pub fn from_reader<R: Read>(source: R) -> Result<Self> {
        Ok(serde_json::from_reader(source)?)
    }

    pub async fn apply(&self, portal: &Portal) -> Result<()> {
        for user in &self.users {
            portal.ledger.register_user(*user).await?;
        }
        for order in &self.orders {
            portal
                .orders
                .checkout(order.user, order.amount, order.tokens, order.method)
                .await?;
        }
        for task in &self.tasks {
            portal.tasks.put_task(task).await?;
        }
        for invite in &self.invites {
            portal
                .invites
                .register_invite(invite.inviter, invite.invitee, invite.reward)
                .await?;
        }

        info!(
            users = self.users.len(),
            orders = self.orders.len(),
            tasks = self.tasks.len(),
            invites = self.invites.len(),
            "Seed applied"
        );
        Ok(())
    }
}
