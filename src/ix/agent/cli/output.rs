//! Table rendering for CLI commands.

use prettytable::{Cell, Row, Table};
use pretty_bytes::converter::convert as human_bytes;

use crate::ix::agent::database::{FileHostUpload, GalleryRecord, TabRecord};
use crate::ix::agent::messages::StatusCheckResult;
use crate::ix::util::temporal;

/// Prints the gallery queue.
pub fn print_queue(items: &[GalleryRecord]) {
    if items.is_empty() {
        println!("The queue is empty.");
        return;
    }
    let mut table = Table::new();
    table.set_titles(Row::new(vec![
        Cell::new("Name"),
        Cell::new("Status"),
        Cell::new("Progress"),
        Cell::new("Images"),
        Cell::new("Size"),
        Cell::new("Tab"),
        Cell::new("Added"),
    ]));
    for item in items {
        table.add_row(Row::new(vec![
            Cell::new(&item.name),
            Cell::new(item.status.as_ref()),
            Cell::new(&format!("{}%", item.progress)),
            Cell::new(&format!("{}/{}", item.uploaded_images, item.total_images)),
            Cell::new(&human_bytes(item.total_size as f64)),
            Cell::new(&item.tab_name),
            Cell::new(&temporal::display_epoch(item.added_time)),
        ]));
    }
    table.printstd();
}

/// Prints the configured tabs.
pub fn print_tabs(tabs: &[TabRecord]) {
    let mut table = Table::new();
    table.set_titles(Row::new(vec![
        Cell::new("Tab"),
        Cell::new("Type"),
        Cell::new("Order"),
    ]));
    for tab in tabs {
        table.add_row(Row::new(vec![
            Cell::new(&tab.name),
            Cell::new(tab.tab_type.as_ref()),
            Cell::new(&tab.display_order.to_string()),
        ]));
    }
    table.printstd();
}

/// Prints galleries whose rename is still pending.
pub fn print_unnamed(unnamed: &[(String, String)]) {
    if unnamed.is_empty() {
        println!("No galleries are waiting for a rename.");
        return;
    }
    let mut table = Table::new();
    table.set_titles(Row::new(vec![
        Cell::new("Gallery ID"),
        Cell::new("Desired name"),
    ]));
    for (gallery_id, name) in unnamed {
        table.add_row(Row::new(vec![Cell::new(gallery_id), Cell::new(name)]));
    }
    table.printstd();
}

/// Prints the per-host upload records for one gallery.
pub fn print_file_host_uploads(records: &[FileHostUpload]) {
    if records.is_empty() {
        println!("No file-host uploads.");
        return;
    }
    let mut table = Table::new();
    table.set_titles(Row::new(vec![
        Cell::new("Host"),
        Cell::new("Status"),
        Cell::new("Transferred"),
        Cell::new("Download URL"),
    ]));
    for record in records {
        table.add_row(Row::new(vec![
            Cell::new(&record.host_name),
            Cell::new(record.status.as_ref()),
            Cell::new(&format!(
                "{}/{}",
                human_bytes(record.uploaded_bytes as f64),
                human_bytes(record.total_bytes as f64)
            )),
            Cell::new(record.download_url.as_deref().unwrap_or("-")),
        ]));
    }
    table.printstd();
}

/// Prints image online-status results per gallery.
pub fn print_status_check(results: &[(&String, &StatusCheckResult)]) {
    let mut table = Table::new();
    table.set_titles(Row::new(vec![
        Cell::new("Gallery"),
        Cell::new("Online"),
        Cell::new("Offline"),
        Cell::new("Total"),
    ]));
    for (_, result) in results {
        table.add_row(Row::new(vec![
            Cell::new(&result.name),
            Cell::new(&result.online.to_string()),
            Cell::new(&result.offline.to_string()),
            Cell::new(&result.total.to_string()),
        ]));
    }
    table.printstd();
}
