//! Holiday calendar and trading-day normalization.

mod holidays;
mod trading_days;

pub use holidays::{
    easter_sunday, estimate_holiday_impacts, french_holidays, holiday_on, Holiday,
};
pub use trading_days::{
    denormalize_forecast, detect_writeoff_months, monthly_trading_day_counts,
    normalize_by_trading_days, DailyActivity, TradingDayConfig, TradingDayModel,
};
