//! Payroll input and output
//!
//! The worker walks an organization's tickets in ascending id order through a
//! [`TicketSource`]; the ascending cursor is what makes checkpoint resume exact.

use async_trait::async_trait;
use sqlx::SqlitePool;
use tms_common::time::now_db_string;
use tms_common::Result;

use crate::models::Ticket;

#[async_trait]
pub trait TicketSource: Send + Sync {
    /// Up to `limit` tickets with `id > after_id`, ascending by id
    async fn fetch_batch(&self, organization_id: &str, after_id: i64, limit: i64) -> Result<Vec<Ticket>>;

    /// Produce the payroll output for one ticket; must be idempotent per job and ticket
    async fn process(&self, job_id: &str, ticket: &Ticket) -> Result<()>;

    /// Tickets with `id > after_id`
    async fn count_remaining(&self, organization_id: &str, after_id: i64) -> Result<i64>;
}

/// Reads `tickets` and writes `payroll_line_items`
#[derive(Clone)]
pub struct DbTicketSource {
    db: SqlitePool,
}

impl DbTicketSource {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl TicketSource for DbTicketSource {
    async fn fetch_batch(&self, organization_id: &str, after_id: i64, limit: i64) -> Result<Vec<Ticket>> {
        let tickets = sqlx::query_as::<_, Ticket>(
            r#"
            SELECT id, organization_id, driver_id, quantity, pay_rate
            FROM tickets
            WHERE organization_id = ? AND id > ?
            ORDER BY id
            LIMIT ?
            "#,
        )
        .bind(organization_id)
        .bind(after_id)
        .bind(limit)
        .fetch_all(&self.db)
        .await?;

        Ok(tickets)
    }

    async fn process(&self, job_id: &str, ticket: &Ticket) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO payroll_line_items (job_id, ticket_id, driver_id, amount, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(job_id)
        .bind(ticket.id)
        .bind(&ticket.driver_id)
        .bind(ticket.amount())
        .bind(now_db_string())
        .execute(&self.db)
        .await?;

        Ok(())
    }

    async fn count_remaining(&self, organization_id: &str, after_id: i64) -> Result<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM tickets WHERE organization_id = ? AND id > ?")
                .bind(organization_id)
                .bind(after_id)
                .fetch_one(&self.db)
                .await?;

        Ok(count)
    }
}
