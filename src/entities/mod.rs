// Lookup tables resolved by name
pub mod lookup_entry;

// Catalog and contract
pub mod catalog_item;
pub mod contract_item;

// Delivery orders and reservations
pub mod delivery_order;
pub mod reservation;

// Demand documents and technical studies
pub mod consolidated_item;
pub mod demand_document;
pub mod demand_item;
pub mod technical_study;

pub mod budget_line;
