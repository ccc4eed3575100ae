use std::{str::FromStr, sync::Arc};

use anyhow::{anyhow, Context, Result};
use chrono::NaiveDate;
use clap::{ArgAction, Args, Parser, Subcommand};
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::info;

use procurement_core::{
    config::{self, AppConfig},
    db::{self, DbPool},
    entities::{lookup_entry::LookupKind, reservation},
    events::{self, Event, EventSender},
    services::{
        budget_ledger::CreateBudgetLineCommand,
        consolidation::{ConsolidateCommand, TechnicalStudyDetails},
        deliveries::{BatchDeliveryItem, BatchDeliveryRequest, RecordDeliveryCommand},
        reservations::ReserveCommand,
    },
    AppServices,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let context = CliContext::initialize(matches!(cli.command, Commands::Migrate)).await?;

    match cli.command {
        Commands::Migrate => handle_migrate(&context, cli.json).await?,
        Commands::Resolve(args) => handle_resolve(&context, args, cli.json).await?,
        Commands::Reserve(args) => handle_reserve(&context, args, cli.json).await?,
        Commands::Cancel(args) => handle_cancel(&context, args, cli.json).await?,
        Commands::Deliver(args) => handle_deliver(&context, args, cli.json).await?,
        Commands::Balance(args) => handle_balance(&context, args, cli.json).await?,
        Commands::Consolidate(args) => handle_consolidate(&context, args, cli.json).await?,
        Commands::Unlink(args) => handle_unlink(&context, args, cli.json).await?,
        Commands::BudgetLine(command) => handle_budget_line(&context, command, cli.json).await?,
        Commands::PendingOrders(args) => handle_pending_orders(&context, args, cli.json).await?,
    }

    Ok(())
}

#[derive(Parser)]
#[command(
    name = "procurement-cli",
    about = "Reservations, deliveries and demand consolidation over the procurement database",
    version
)]
struct Cli {
    #[arg(
        long,
        global = true,
        action = ArgAction::SetTrue,
        help = "Render command output as pretty JSON"
    )]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply pending schema migrations
    Migrate,
    /// Resolve a name or code to its lookup id, creating it on first use
    Resolve(ResolveArgs),
    /// Reserve quantity against a contract item
    Reserve(ReserveArgs),
    /// Cancel a reservation and release its quantity
    Cancel(CancelArgs),
    /// Record a delivery for one reservation, or a delivery note covering several
    Deliver(DeliverArgs),
    /// Show the balance of a contract item
    Balance(BalanceArgs),
    /// Consolidate demand documents into a technical study
    Consolidate(ConsolidateArgs),
    /// Release a demand document from a technical study
    Unlink(UnlinkArgs),
    #[command(subcommand)]
    BudgetLine(BudgetLineCommands),
    /// Delivery orders still waiting for deliveries
    PendingOrders(PendingOrdersArgs),
}

#[derive(Args)]
struct ResolveArgs {
    #[arg(long, value_parser = parse_lookup_kind, help = "Lookup kind (unit, place, agent, budget_allocation, ...)")]
    kind: LookupKind,
    #[arg(help = "Name or code as typed")]
    name: String,
}

#[derive(Args)]
struct ReserveArgs {
    #[arg(long, help = "Contract item identifier")]
    contract_item: i32,
    #[arg(long, help = "Delivery order identifier")]
    delivery_order: i32,
    #[arg(long, value_parser = parse_decimal, help = "Quantity to reserve")]
    quantity: Decimal,
}

#[derive(Args)]
struct CancelArgs {
    #[arg(help = "Reservation identifier")]
    reservation: i32,
}

#[derive(Args)]
struct DeliverArgs {
    #[arg(long, help = "Reservation identifier (single delivery)")]
    reservation: Option<i32>,
    #[arg(long, value_parser = parse_decimal, help = "Delivered quantity (single delivery)")]
    quantity: Option<Decimal>,
    #[arg(long, help = "Delivery note number")]
    note: Option<String>,
    #[arg(long, value_parser = parse_date, help = "Delivery date (YYYY-MM-DD)")]
    date: Option<NaiveDate>,
    #[arg(
        long = "item",
        value_parser = parse_batch_item,
        help = "Batch entry RESERVATION:QUANTITY; repeat for each reservation on the note"
    )]
    items: Vec<BatchDeliveryItem>,
}

#[derive(Args)]
struct BalanceArgs {
    #[arg(help = "Contract item identifier")]
    contract_item: i32,
}

#[derive(Args)]
struct ConsolidateArgs {
    #[arg(long, value_delimiter = ',', required = true, help = "Demand document ids, comma separated")]
    documents: Vec<i32>,
    #[arg(long, help = "Study title")]
    title: Option<String>,
}

#[derive(Args)]
struct UnlinkArgs {
    #[arg(long, help = "Technical study identifier")]
    study: i32,
    #[arg(long, help = "Demand document identifier")]
    document: i32,
}

#[derive(Subcommand)]
enum BudgetLineCommands {
    /// Create a budget line
    Create(CreateBudgetLineArgs),
    /// Show the balances of a budget line
    Show(ShowBudgetLineArgs),
    /// List budget lines
    List(ListBudgetLinesArgs),
}

#[derive(Args)]
struct CreateBudgetLineArgs {
    #[arg(long, help = "Fiscal year (2000 or later)")]
    year: i32,
    #[arg(long, help = "Internal ledger number")]
    ledger: String,
    #[arg(long, help = "Organizational unit id")]
    unit: i32,
    #[arg(long, value_parser = parse_decimal, help = "Initial balance")]
    balance: Decimal,
}

#[derive(Args)]
struct ShowBudgetLineArgs {
    #[arg(help = "Budget line identifier")]
    id: i32,
}

#[derive(Args)]
struct ListBudgetLinesArgs {
    #[arg(long, help = "Restrict to one fiscal year")]
    year: Option<i32>,
}

#[derive(Args)]
struct PendingOrdersArgs {
    #[arg(long, default_value_t = 1, value_parser = parse_positive_u64)]
    page: u64,
    #[arg(long, default_value_t = 20, value_parser = parse_positive_u64)]
    limit: u64,
}

struct CliContext {
    _config: AppConfig,
    db: Arc<DbPool>,
    services: AppServices,
}

impl CliContext {
    async fn initialize(skip_auto_migrate: bool) -> Result<Self> {
        let config = config::load_config().context("failed to load application config")?;
        config::init_tracing(config.log_level(), config.log_json);

        let db_pool = db::establish_connection_from_app_config(&config)
            .await
            .context("failed to connect to database")?;
        if config.auto_migrate && !skip_auto_migrate {
            db::run_migrations(&db_pool)
                .await
                .context("failed to run migrations")?;
        }
        let db = Arc::new(db_pool);

        let (event_tx, event_rx) = mpsc::channel::<Event>(config.event_channel_capacity);
        tokio::spawn(events::process_events(event_rx));
        let services = AppServices::new(db.clone(), EventSender::new(event_tx), &config);

        Ok(Self {
            _config: config,
            db,
            services,
        })
    }
}

async fn handle_migrate(context: &CliContext, json: bool) -> Result<()> {
    db::run_migrations(&context.db)
        .await
        .context("failed to run migrations")?;
    info!("Migrations applied");
    if json {
        print_json(&serde_json::json!({ "migrated": true }))?;
    } else {
        println!("Migrations applied");
    }
    Ok(())
}

async fn handle_resolve(context: &CliContext, args: ResolveArgs, json: bool) -> Result<()> {
    let resolution = context
        .services
        .resolver
        .resolve(args.kind, &args.name)
        .await
        .with_context(|| format!("failed to resolve {} '{}'", args.kind, args.name))?;

    if json {
        print_json(&resolution)?;
    } else {
        let verb = if resolution.created() { "created" } else { "found" };
        println!("{} '{}' -> id {} ({})", args.kind, args.name.trim(), resolution.id, verb);
    }
    Ok(())
}

async fn handle_reserve(context: &CliContext, args: ReserveArgs, json: bool) -> Result<()> {
    let reservation = context
        .services
        .reservations
        .reserve(ReserveCommand {
            contract_item_id: args.contract_item,
            delivery_order_id: args.delivery_order,
            requested_quantity: args.quantity,
        })
        .await
        .context("reservation refused")?;

    if json {
        print_json(&reservation)?;
    } else {
        render_reservation(&reservation);
    }
    Ok(())
}

async fn handle_cancel(context: &CliContext, args: CancelArgs, json: bool) -> Result<()> {
    let reservation = context
        .services
        .reservations
        .cancel(args.reservation)
        .await
        .with_context(|| format!("failed to cancel reservation {}", args.reservation))?;

    if json {
        print_json(&reservation)?;
    } else {
        render_reservation(&reservation);
    }
    Ok(())
}

async fn handle_deliver(context: &CliContext, args: DeliverArgs, json: bool) -> Result<()> {
    if !args.items.is_empty() {
        if args.reservation.is_some() || args.quantity.is_some() {
            return Err(anyhow!("use either --item entries or --reservation/--quantity, not both"));
        }
        let note_number = args
            .note
            .ok_or_else(|| anyhow!("--note is required for a delivery note batch"))?;
        let delivery_date = args.date.unwrap_or_else(|| chrono::Utc::now().date_naive());

        let result = context
            .services
            .deliveries
            .record_delivery_batch(BatchDeliveryRequest {
                note_number,
                delivery_date,
                items: args.items,
            })
            .await
            .context("delivery note rejected; nothing was recorded")?;

        if json {
            print_json(&result)?;
        } else {
            println!("{}", result.message);
            for reservation in &result.reservations {
                render_reservation(reservation);
            }
        }
        return Ok(());
    }

    let reservation_id = args
        .reservation
        .ok_or_else(|| anyhow!("--reservation is required"))?;
    let quantity = args.quantity.ok_or_else(|| anyhow!("--quantity is required"))?;
    let reservation = context
        .services
        .deliveries
        .record_delivery(RecordDeliveryCommand {
            reservation_id,
            quantity,
            note_number: args.note,
            delivery_date: args.date,
        })
        .await
        .with_context(|| format!("failed to record delivery for reservation {}", reservation_id))?;

    if json {
        print_json(&reservation)?;
    } else {
        render_reservation(&reservation);
    }
    Ok(())
}

async fn handle_balance(context: &CliContext, args: BalanceArgs, json: bool) -> Result<()> {
    let balance = context
        .services
        .contracts
        .item_balance(args.contract_item)
        .await
        .with_context(|| format!("failed to load contract item {}", args.contract_item))?;

    if json {
        print_json(&balance)?;
    } else {
        println!(
            "Contract item {} • contracted {} • reserved {} • available {}",
            balance.contract_item_id, balance.contracted, balance.reserved, balance.available
        );
    }
    Ok(())
}

async fn handle_consolidate(context: &CliContext, args: ConsolidateArgs, json: bool) -> Result<()> {
    let details = context
        .services
        .consolidation
        .consolidate(ConsolidateCommand {
            title: args.title,
            demand_document_ids: args.documents,
        })
        .await
        .context("consolidation refused")?;

    if json {
        print_json(&details)?;
    } else {
        render_study(&details);
    }
    Ok(())
}

async fn handle_unlink(context: &CliContext, args: UnlinkArgs, json: bool) -> Result<()> {
    let document = context
        .services
        .consolidation
        .unlink(args.study, args.document)
        .await
        .with_context(|| {
            format!(
                "failed to unlink demand document {} from study {}",
                args.document, args.study
            )
        })?;

    if json {
        print_json(&document)?;
    } else {
        println!(
            "Demand document {} ({}) released • status {}",
            document.id, document.reference, document.status
        );
    }
    Ok(())
}

async fn handle_budget_line(
    context: &CliContext,
    command: BudgetLineCommands,
    json: bool,
) -> Result<()> {
    let budget = &context.services.budget;
    match command {
        BudgetLineCommands::Create(args) => {
            let line = budget
                .create_budget_line(CreateBudgetLineCommand {
                    fiscal_year: args.year,
                    ledger_number: args.ledger,
                    unit_id: args.unit,
                    initial_balance: args.balance,
                })
                .await
                .context("failed to create budget line")?;
            if json {
                print_json(&line)?;
            } else {
                println!(
                    "Budget line {} • {} / unit {} / {} • balance {}",
                    line.id, line.fiscal_year, line.unit_id, line.ledger_number, line.current_balance
                );
            }
        }
        BudgetLineCommands::Show(args) => {
            let balance = budget
                .get_balance(args.id)
                .await
                .with_context(|| format!("failed to load budget line {}", args.id))?;
            if json {
                print_json(&balance)?;
            } else {
                println!(
                    "Budget line {} • initial {} • current {}",
                    balance.budget_line_id, balance.initial_balance, balance.current_balance
                );
            }
        }
        BudgetLineCommands::List(args) => {
            let lines = budget
                .list_budget_lines(args.year)
                .await
                .context("failed to list budget lines")?;
            if json {
                print_json(&lines)?;
            } else if lines.is_empty() {
                println!("No budget lines");
            } else {
                for line in &lines {
                    println!(
                        "- {} • {} / unit {} / {} • balance {}",
                        line.id,
                        line.fiscal_year,
                        line.unit_id,
                        line.ledger_number,
                        line.current_balance
                    );
                }
            }
        }
    }
    Ok(())
}

async fn handle_pending_orders(
    context: &CliContext,
    args: PendingOrdersArgs,
    json: bool,
) -> Result<()> {
    let page = context
        .services
        .delivery_orders
        .list_pending_delivery_orders(args.page, args.limit)
        .await
        .context("failed to list pending delivery orders")?;

    if json {
        print_json(&page)?;
    } else if page.items.is_empty() {
        println!("No delivery orders waiting for deliveries");
    } else {
        println!("Page {} ({} pending in total)", page.page, page.total);
        for order in &page.items {
            println!(
                "- {} • {} • {} open reservation(s) • {} day(s) since issue",
                order.delivery_order_id, order.order_number, order.open_reservations, order.days_elapsed
            );
        }
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn render_reservation(reservation: &reservation::Model) {
    println!(
        "- Reservation {} • contract item {} • requested {} • delivered {} • {}",
        reservation.id,
        reservation.contract_item_id,
        reservation.requested_quantity,
        reservation.delivered_quantity,
        reservation.status
    );
}

fn render_study(details: &TechnicalStudyDetails) {
    println!(
        "Technical study {} \"{}\" • documents {:?}",
        details.study.id, details.study.title, details.demand_document_ids
    );
    for item in &details.items {
        println!(
            "- catalog item {} • quantity {}",
            item.catalog_item_id, item.quantity
        );
    }
}

fn parse_decimal(raw: &str) -> Result<Decimal, String> {
    Decimal::from_str(raw).map_err(|_| format!("invalid decimal '{raw}'"))
}

fn parse_date(raw: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|_| format!("invalid date '{raw}'"))
}

fn parse_lookup_kind(raw: &str) -> Result<LookupKind, String> {
    LookupKind::from_str(raw).map_err(|_| format!("unknown lookup kind '{raw}'"))
}

fn parse_batch_item(raw: &str) -> Result<BatchDeliveryItem, String> {
    let (reservation, quantity) = raw
        .split_once(':')
        .ok_or_else(|| format!("expected RESERVATION:QUANTITY, got '{raw}'"))?;
    let reservation_id = reservation
        .trim()
        .parse()
        .map_err(|_| format!("invalid reservation id '{reservation}'"))?;
    Ok(BatchDeliveryItem {
        reservation_id,
        quantity: parse_decimal(quantity.trim())?,
    })
}

fn parse_positive_u64(raw: &str) -> Result<u64, String> {
    let value: u64 = raw
        .parse()
        .map_err(|_| format!("invalid integer '{raw}'"))?;
    if value == 0 {
        return Err("value must be greater than zero".to_string());
    }
    Ok(value)
}
