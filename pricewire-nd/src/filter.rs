//! Subscriber preference filter
//!
//! A glitch reaches a user only when it clears every preference: profit
//! margin floor, category interest (case-insensitive substring), retailer
//! allow-list, and price band.

use pricewire_common::models::{NotificationPrefs, ValidatedGlitch};

pub fn passes_filter(prefs: &NotificationPrefs, glitch: &ValidatedGlitch) -> bool {
    if glitch.profit_margin < prefs.min_profit_margin {
        return false;
    }

    if !prefs.categories.is_empty() {
        let category = glitch.product.category.to_lowercase();
        let interested = prefs
            .categories
            .iter()
            .any(|wanted| category.contains(&wanted.to_lowercase()));
        if !interested {
            return false;
        }
    }

    if !prefs.retailers.is_empty() {
        let matched = prefs
            .retailers
            .iter()
            .any(|wanted| wanted.eq_ignore_ascii_case(&glitch.product.retailer));
        if !matched {
            return false;
        }
    }

    let price = glitch.product.current_price;
    price >= prefs.min_price && price <= prefs.max_price
}
