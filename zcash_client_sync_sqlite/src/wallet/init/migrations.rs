mod initial_setup;
mod scan_checkpoints;

use schemerz_rusqlite::RusqliteMigration;

use super::NoteMigrationError;

pub(super) fn all_migrations() -> Vec<Box<dyn RusqliteMigration<Error = NoteMigrationError>>> {
    //   initial_setup
    //         |
    //  scan_checkpoints
    vec![
        Box::new(initial_setup::Migration),
        Box::new(scan_checkpoints::Migration),
    ]
}
