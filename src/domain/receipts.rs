//! Payment receipt fields.

use time::OffsetDateTime;

use super::certificates::{bounded, issue_date_label, required};
use super::error::DomainError;

/// Prefix for receipt numbers when the deployment does not configure one.
pub const DEFAULT_RECEIPT_PREFIX: &str = "RCPT";

const MAX_AMOUNT_DIGITS: usize = 12;

/// Validated payment data merged into a receipt template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiptFields {
    pub payer_name: String,
    pub payer_email: String,
    pub course: String,
    /// Always two decimal places, e.g. `1499.00`.
    pub amount: String,
    pub payment_id: String,
    pub order_id: String,
    pub paid_on: String,
}

/// Raw receipt input before validation.
#[derive(Debug, Clone)]
pub struct ReceiptInput<'a> {
    pub name: &'a str,
    pub email: &'a str,
    pub course: &'a str,
    pub amount: &'a str,
    pub payment_id: &'a str,
    pub order_id: &'a str,
    pub date: Option<&'a str>,
}

impl ReceiptFields {
    /// Trim and validate raw input. A blank date falls back to `today`.
    pub fn new(input: ReceiptInput<'_>, today: OffsetDateTime) -> Result<Self, DomainError> {
        let paid_on = match input.date.map(str::trim).filter(|value| !value.is_empty()) {
            Some(value) => bounded("date", value)?,
            None => issue_date_label(today),
        };

        Ok(Self {
            payer_name: required("name", input.name)?,
            payer_email: email(input.email)?,
            course: required("course", input.course)?,
            amount: amount(input.amount)?,
            payment_id: required("paymentId", input.payment_id)?,
            order_id: required("orderId", input.order_id)?,
            paid_on,
        })
    }
}

fn email(raw: &str) -> Result<String, DomainError> {
    let value = required("email", raw)?;
    let well_formed = value
        .split_once('@')
        .is_some_and(|(local, domain)| !local.is_empty() && !domain.is_empty())
        && !value.chars().any(char::is_whitespace);
    if !well_formed {
        return Err(DomainError::validation("email", "must be an email address"));
    }
    Ok(value)
}

fn amount(raw: &str) -> Result<String, DomainError> {
    let value = required("amount", raw)?;
    let (whole, fraction) = value.split_once('.').unwrap_or((value.as_str(), ""));

    let digits = |part: &str| part.chars().all(|ch| ch.is_ascii_digit());
    if whole.is_empty() || whole.len() > MAX_AMOUNT_DIGITS || !digits(whole) {
        return Err(DomainError::validation(
            "amount",
            "must be a non-negative decimal number",
        ));
    }
    if fraction.len() > 2 || !digits(fraction) {
        return Err(DomainError::validation(
            "amount",
            "must have at most two decimal places",
        ));
    }

    let whole = whole.trim_start_matches('0');
    let whole = if whole.is_empty() { "0" } else { whole };
    Ok(format!("{whole}.{fraction:0<2}"))
}
