use portal_ledger::domain::ids::{Tokens, UserId};
use portal_ledger::domain::payment::PaymentConfirmation;
use portal_ledger::error::PortalError;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;
use std::collections::HashMap;

mod common;
use common::{Harness, amount, daily_task};

const USERS: [UserId; 3] = [1, 2, 3];

#[tokio::test]
async fn test_random_operations_keep_ledger_in_sync() {
    let h = Harness::new().await;
    h.users(&USERS).await;
    h.portal.tasks.put_task(&daily_task(1, 7, 0)).await.unwrap();

    let mut rng = StdRng::seed_from_u64(0x5eed);
    let mut expected: HashMap<UserId, Tokens> = USERS.iter().map(|u| (*u, 0)).collect();
    let mut txn = 0;

    for _ in 0..300 {
        let user = USERS[rng.gen_range(0..USERS.len())];
        let model = expected.get_mut(&user).unwrap();

        match rng.gen_range(0..4) {
            0 => {
                let tokens: Tokens = rng.gen_range(1..=200);
                let price = Decimal::new(tokens, 1);
                let order = h.order(user, price, tokens).await;
                txn += 1;
                h.portal
                    .reconciler
                    .reconcile(PaymentConfirmation::success(
                        order.id,
                        format!("TXN{txn}"),
                        amount(price),
                    ))
                    .await
                    .unwrap();
                *model += tokens;
            }
            1 => {
                let cost: Tokens = rng.gen_range(1..=60);
                match h.portal.ledger.consume(user, cost, 1, None).await {
                    Ok(entry) => {
                        *model -= cost;
                        assert_eq!(entry.balance_after, *model);
                    }
                    Err(PortalError::InsufficientBalance { balance, .. }) => {
                        assert!(*model < cost);
                        assert_eq!(balance, *model);
                    }
                    Err(e) => panic!("unexpected error {e}"),
                }
            }
            2 => {
                let mut delta: Tokens = rng.gen_range(-40..=40);
                if delta == 0 {
                    delta = 1;
                }
                match h.portal.ledger.adjust(user, delta, 9, None).await {
                    Ok(_) => *model += delta,
                    Err(PortalError::InsufficientBalance { .. }) => assert!(*model + delta < 0),
                    Err(e) => panic!("unexpected error {e}"),
                }
            }
            _ => {
                h.portal
                    .tasks
                    .complete_task(user, 1, Default::default())
                    .await
                    .unwrap();
                *model += 7;
            }
        }
    }

    for user in USERS {
        assert_eq!(h.balance(user).await, expected[&user]);
        h.assert_ledger_consistent(user).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_spending_never_overdraws() {
    let h = Harness::new().await;
    h.users(&[1]).await;
    h.portal.ledger.adjust(1, 100, 1, None).await.unwrap();

    let mut consumes = Vec::new();
    let mut top_ups = Vec::new();
    for i in 0..70 {
        let portal = h.portal.clone();
        if i % 7 == 0 {
            top_ups.push(tokio::spawn(async move {
                portal.ledger.adjust(1, 1, 1, None).await
            }));
        } else {
            consumes.push(tokio::spawn(async move {
                portal.ledger.consume(1, 3, 2, None).await
            }));
        }
    }

    let mut spent = 0;
    for handle in consumes {
        match handle.await.unwrap() {
            Ok(_) => spent += 3,
            Err(PortalError::InsufficientBalance { .. }) => {}
            Err(e) => panic!("unexpected error {e}"),
        }
    }
    let mut added = 0;
    for handle in top_ups {
        handle.await.unwrap().unwrap();
        added += 1;
    }

    let balance = h.balance(1).await;
    assert_eq!(balance, 100 + added - spent);
    assert!(balance >= 0);
    h.assert_ledger_consistent(1).await;
}
