//! Budget Allocation Ledger
//!
//! Budget lines (Dotacao) are keyed by fiscal year, organizational unit and internal ledger
//! number. Balances are recorded as given; nothing here debits them.

use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, QueryOrder, Set};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use validator::Validate;

use super::{money, validate_non_negative};
use crate::db::DbPool;
use crate::entities::budget_line::{self, Entity as BudgetLine};
use crate::errors::{is_unique_violation, ServiceError};
use crate::events::{Event, EventSender};

pub const MIN_FISCAL_YEAR: i32 = 2000;

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CreateBudgetLineCommand {
    pub fiscal_year: i32,
    #[validate(length(min = 1, max = 32))]
    pub ledger_number: String,
    pub unit_id: i32,
    #[validate(custom = "validate_non_negative")]
    pub initial_balance: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetBalance {
    pub budget_line_id: i32,
    pub initial_balance: Decimal,
    pub current_balance: Decimal,
}

#[derive(Clone)]
pub struct BudgetLedgerService {
    db_pool: Arc<DbPool>,
    event_sender: EventSender,
}

impl BudgetLedgerService {
    pub fn new(db_pool: Arc<DbPool>, event_sender: EventSender) -> Self {
        Self {
            db_pool,
            event_sender,
        }
    }

    /// Creates a budget line whose current balance starts at the initial balance.
    #[instrument(skip(self))]
    pub async fn create_budget_line(
        &self,
        command: CreateBudgetLineCommand,
    ) -> Result<budget_line::Model, ServiceError> {
        if command.fiscal_year < MIN_FISCAL_YEAR {
            return Err(ServiceError::InvalidFiscalYear(command.fiscal_year));
        }
        command.validate()?;

        let db = &*self.db_pool;
        let ledger_number = command.ledger_number.trim().to_string();
        let duplicate = || ServiceError::DuplicateBudgetLine {
            fiscal_year: command.fiscal_year,
            unit_id: command.unit_id,
            ledger_number: ledger_number.clone(),
        };

        let existing = BudgetLine::find()
            .filter(budget_line::Column::FiscalYear.eq(command.fiscal_year))
            .filter(budget_line::Column::UnitId.eq(command.unit_id))
            .filter(budget_line::Column::LedgerNumber.eq(ledger_number.as_str()))
            .one(db)
            .await
            .map_err(ServiceError::db_error)?;
        if existing.is_some() {
            warn!(fiscal_year = command.fiscal_year, unit_id = command.unit_id, ledger_number = %ledger_number, "Duplicate budget line");
            return Err(duplicate());
        }

        let balance = money(command.initial_balance);
        let created = budget_line::ActiveModel {
            fiscal_year: Set(command.fiscal_year),
            ledger_number: Set(ledger_number.clone()),
            unit_id: Set(command.unit_id),
            initial_balance: Set(balance),
            current_balance: Set(balance),
            ..Default::default()
        }
        .insert(db)
        .await
        .map_err(|e| {
            // Lost a race against a concurrent insert of the same key.
            if is_unique_violation(&e) {
                duplicate()
            } else {
                ServiceError::db_error(e)
            }
        })?;

        info!(
            budget_line_id = created.id,
            fiscal_year = created.fiscal_year,
            unit_id = created.unit_id,
            "Budget line created"
        );
        self.event_sender
            .send_or_log(Event::BudgetLineCreated {
                budget_line_id: created.id,
                fiscal_year: created.fiscal_year,
                unit_id: created.unit_id,
            })
            .await;
        Ok(created)
    }

    #[instrument(skip(self))]
    pub async fn get_budget_line(&self, id: i32) -> Result<budget_line::Model, ServiceError> {
        BudgetLine::find_by_id(id)
            .one(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::NotFound(format!("Budget line {} not found", id)))
    }

    pub async fn get_balance(&self, id: i32) -> Result<BudgetBalance, ServiceError> {
        let line = self.get_budget_line(id).await?;
        Ok(BudgetBalance {
            budget_line_id: line.id,
            initial_balance: line.initial_balance,
            current_balance: line.current_balance,
        })
    }

    /// Budget lines, optionally restricted to one fiscal year.
    #[instrument(skip(self))]
    pub async fn list_budget_lines(
        &self,
        fiscal_year: Option<i32>,
    ) -> Result<Vec<budget_line::Model>, ServiceError> {
        let mut query = BudgetLine::find();
        if let Some(year) = fiscal_year {
            query = query.filter(budget_line::Column::FiscalYear.eq(year));
        }
        query
            .order_by_asc(budget_line::Column::FiscalYear)
            .order_by_asc(budget_line::Column::UnitId)
            .order_by_asc(budget_line::Column::LedgerNumber)
            .all(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)
    }
}
