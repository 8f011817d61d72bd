mod eligibility;
mod ranking;

pub use eligibility::filter;
pub use ranking::{prioritize, rank, RankedDriver, Strategy};
