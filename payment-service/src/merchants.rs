use diesel::prelude::*;
use diesel_async::RunQueryDsl;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use shared::db::{release_job_lock, try_job_lock, DbPool, MERCHANT_POLLER_LOCK};
use shared::models::*;
use shared::schema::*;
use shared::{escalate_invariant, SharedClock, TicketError, TicketResult};

use crate::gateway::{CreateStoreRequest, CreateTerminalRequest, GatewayClient, MerchantApplicationForm};

pub const ACTIVE: &str = "ACTIVE";
const CLOSED_STATUSES: [&str; 2] = ["REJECTED", "CLOSED"];

#[derive(Debug, Clone, Deserialize)]
pub struct MerchantApplicationBody {
    pub legal_name: String,
    pub organization_number: String,
    pub email: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PollRun {
    pub merchants: usize,
    pub activated: usize,
    pub stores_created: usize,
    pub failed: usize,
}

/// What still has to happen for one organization under an active merchant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreWork {
    CreateStore { organization_id: Uuid, name: String },
    CreateTerminal { store_row: Uuid, store_id: String, name: String },
}

/// Organizations with a finished store are skipped; a store left without a
/// terminal by an earlier failed run only gets its terminal.
pub fn pending_store_work(organizations: &[Organization], existing: &[Store]) -> Vec<StoreWork> {
    let by_org: HashMap<Uuid, &Store> = existing.iter().map(|s| (s.organization_id, s)).collect();
    organizations
        .iter()
        .filter_map(|org| match by_org.get(&org.id) {
            None => Some(StoreWork::CreateStore {
                organization_id: org.id,
                name: org.name.clone(),
            }),
            Some(store) if store.terminal_id.is_none() => Some(StoreWork::CreateTerminal {
                store_row: store.id,
                store_id: store.store_id.clone(),
                name: store.name.clone(),
            }),
            Some(_) => None,
        })
        .collect()
}

pub fn is_ongoing(application_status: &str) -> bool {
    application_status != ACTIVE && !CLOSED_STATUSES.contains(&application_status)
}

pub struct MerchantOnboarding {
    pool: DbPool,
    gateway: Arc<GatewayClient>,
    clock: SharedClock,
    webhook_url: Option<String>,
    interval: std::time::Duration,
}

impl MerchantOnboarding {
    pub fn new(
        pool: DbPool,
        gateway: Arc<GatewayClient>,
        clock: SharedClock,
        webhook_url: Option<String>,
        interval: std::time::Duration,
    ) -> Self {
        Self { pool, gateway, clock, webhook_url, interval }
    }

    pub async fn create_application(&self, network_id: Uuid, body: MerchantApplicationBody) -> TicketResult<Merchant> {
        let application = self
            .gateway
            .create_merchant(&MerchantApplicationForm {
                legal_name: body.legal_name,
                organization_number: body.organization_number,
                email: body.email,
            })
            .await?;

        let now = self.clock.now();
        let merchant = Merchant {
            id: Uuid::new_v4(),
            network_id,
            application_id: application.application_id,
            application_status: application.application_status,
            web_kyb_url: application.web_kyb_url,
            merchant_id: None,
            default_store_id: None,
            created_at: now,
            updated_at: now,
        };

        let mut conn = self.pool.get().await?;
        let merchant = diesel::insert_into(merchants::table)
            .values(&merchant)
            .get_result::<Merchant>(&mut conn)
            .await?;
        info!(network_id = %network_id, application_id = %merchant.application_id, "merchant application created");
        Ok(merchant)
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = time::interval(self.interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => break,
            }

            match self.poll_applications(&shutdown).await {
                Ok(run) if run.activated > 0 || run.stores_created > 0 || run.failed > 0 => {
                    info!(
                        merchants = run.merchants,
                        activated = run.activated,
                        stores_created = run.stores_created,
                        failed = run.failed,
                        "merchant poll finished"
                    );
                }
                Ok(_) => debug!("merchant poll found nothing new"),
                Err(e) => error!("Error polling merchant applications: {}", e),
            }
        }
        info!("merchant poller stopped");
    }

    pub async fn poll_applications(&self, shutdown: &watch::Receiver<bool>) -> TicketResult<PollRun> {
        let mut lock_conn = self.pool.get().await?;
        if !try_job_lock(&mut lock_conn, MERCHANT_POLLER_LOCK).await? {
            debug!("another merchant poller holds the job lock");
            return Ok(PollRun::default());
        }

        let result = self.poll_all(shutdown).await;
        release_job_lock(&mut lock_conn, MERCHANT_POLLER_LOCK).await?;
        result
    }

    async fn poll_all(&self, shutdown: &watch::Receiver<bool>) -> TicketResult<PollRun> {
        let candidates = {
            let mut conn = self.pool.get().await?;
            merchants::table
                .filter(merchants::application_status.ne_all(CLOSED_STATUSES))
                .order(merchants::created_at.asc())
                .select(Merchant::as_select())
                .load::<Merchant>(&mut conn)
                .await?
        };

        let mut run = PollRun::default();
        for merchant in candidates {
            if *shutdown.borrow() {
                info!("shutdown requested, stopping merchant poll");
                break;
            }
            run.merchants += 1;
            match self.poll_one(merchant.clone()).await {
                Ok((activated, created)) => {
                    run.activated += usize::from(activated);
                    run.stores_created += created;
                }
                Err(e) => {
                    run.failed += 1;
                    escalate_invariant(&e);
                    error!(application_id = %merchant.application_id, "Error polling merchant: {}", e);
                }
            }
        }
        Ok(run)
    }

    /// Refreshes one application and, once active, fills in missing stores.
    async fn poll_one(&self, merchant: Merchant) -> TicketResult<(bool, usize)> {
        let mut merchant = merchant;
        let mut activated = false;

        if is_ongoing(&merchant.application_status) {
            let report = self.gateway.application_status(&merchant.application_id).await?;
            if report.application_id != merchant.application_id {
                return Err(TicketError::GatewayFailure(format!(
                    "status for application {} came back for {}",
                    merchant.application_id, report.application_id
                )));
            }
            let changed = report.application_status != merchant.application_status
                || report.merchant_id != merchant.merchant_id
                || report.store_id != merchant.default_store_id;
            if changed {
                let mut conn = self.pool.get().await?;
                merchant = diesel::update(merchants::table.find(merchant.id))
                    .set((
                        merchants::application_status.eq(&report.application_status),
                        merchants::merchant_id.eq(&report.merchant_id),
                        merchants::default_store_id.eq(&report.store_id),
                        merchants::updated_at.eq(self.clock.now()),
                    ))
                    .returning(Merchant::as_returning())
                    .get_result::<Merchant>(&mut conn)
                    .await?;
                activated = merchant.application_status == ACTIVE;
                info!(
                    application_id = %merchant.application_id,
                    status = %merchant.application_status,
                    "merchant application status changed"
                );
            }
        }

        if merchant.application_status != ACTIVE {
            return Ok((activated, 0));
        }
        let (Some(merchant_id), Some(_)) = (merchant.merchant_id.as_deref(), merchant.default_store_id.as_deref())
        else {
            warn!(application_id = %merchant.application_id, "active merchant without merchant or store id");
            return Ok((activated, 0));
        };

        let created = self.ensure_stores(merchant_id, merchant.network_id).await?;
        Ok((activated, created))
    }

    /// Creates a gateway store and online terminal for every organization in
    /// the network that lacks one. Safe to rerun.
    pub async fn ensure_stores(&self, merchant_id: &str, network_id: Uuid) -> TicketResult<usize> {
        let mut conn = self.pool.get().await?;
        let organizations = organizations::table
            .filter(organizations::network_id.eq(network_id))
            .select(Organization::as_select())
            .load::<Organization>(&mut conn)
            .await?;
        let existing = stores::table
            .filter(stores::merchant_id.eq(merchant_id))
            .select(Store::as_select())
            .load::<Store>(&mut conn)
            .await?;

        let mut created = 0;
        for work in pending_store_work(&organizations, &existing) {
            let (store_row, store_id, name) = match work {
                StoreWork::CreateStore { organization_id, name } => {
                    let store = self
                        .gateway
                        .create_store(merchant_id, &CreateStoreRequest { name: name.clone() })
                        .await?;
                    let row = Store {
                        id: Uuid::new_v4(),
                        merchant_id: merchant_id.to_string(),
                        organization_id,
                        store_id: store.store_id.clone(),
                        terminal_id: None,
                        name: store.name,
                        created_at: self.clock.now(),
                    };
                    // Recorded before the terminal so a failure below does not create a second store.
                    let inserted = diesel::insert_into(stores::table)
                        .values(&row)
                        .on_conflict((stores::merchant_id, stores::organization_id))
                        .do_nothing()
                        .execute(&mut conn)
                        .await?;
                    if inserted == 0 {
                        debug!(organization_id = %organization_id, "store recorded concurrently, skipping");
                        continue;
                    }
                    created += 1;
                    (row.id, row.store_id, name)
                }
                StoreWork::CreateTerminal { store_row, store_id, name } => (store_row, store_id, name),
            };

            let terminal = self
                .gateway
                .create_online_terminal(
                    merchant_id,
                    &store_id,
                    &CreateTerminalRequest {
                        name,
                        webhook_url: self.webhook_url.clone(),
                    },
                )
                .await?;
            let updated = diesel::update(stores::table.find(store_row))
                .set(stores::terminal_id.eq(&terminal.terminal_id))
                .execute(&mut conn)
                .await?;
            if updated != 1 {
                return Err(TicketError::Invariant(format!("store row {} vanished", store_row)));
            }
            info!(merchant_id, store_id = %store_id, terminal_id = %terminal.terminal_id, "store terminal ready");
        }
        Ok(created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn org(name: &str) -> Organization {
        Organization {
            id: Uuid::new_v4(),
            network_id: Uuid::nil(),
            name: name.to_string(),
        }
    }

    fn store(org: &Organization, terminal: Option<&str>) -> Store {
        Store {
            id: Uuid::new_v4(),
            merchant_id: "m-1".to_string(),
            organization_id: org.id,
            store_id: format!("store-{}", org.name),
            terminal_id: terminal.map(str::to_string),
            name: org.name.clone(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn existing_stores_are_skipped() {
        let a = org("chess-club");
        let b = org("film-society");
        let existing = vec![store(&a, Some("term-a"))];

        let work = pending_store_work(&[a, b.clone()], &existing);
        assert_eq!(
            work,
            vec![StoreWork::CreateStore {
                organization_id: b.id,
                name: "film-society".to_string()
            }]
        );
    }

    #[test]
    fn half_finished_store_only_needs_terminal() {
        let a = org("choir");
        let existing = vec![store(&a, None)];
        let work = pending_store_work(&[a], &existing);
        assert!(matches!(&work[..], [StoreWork::CreateTerminal { store_id, .. }] if store_id == "store-choir"));
    }

    #[test]
    fn fully_set_up_network_needs_nothing() {
        let a = org("choir");
        let existing = vec![store(&a, Some("term"))];
        assert!(pending_store_work(&[a], &existing).is_empty());
    }

    #[test]
    fn application_status_classification() {
        assert!(is_ongoing("CREATED"));
        assert!(is_ongoing("IN_REVIEW"));
        assert!(!is_ongoing(ACTIVE));
        assert!(!is_ongoing("REJECTED"));
    }
}
