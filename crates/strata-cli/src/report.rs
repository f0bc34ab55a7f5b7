use strata_db::{ApplyReport, Direction, MigrationStatus, SchemaVersion};

const WIDTH: usize = 72;

/// Boxed table of the catalog with each migration's ledger state.
pub fn print_status(current: SchemaVersion, statuses: &[MigrationStatus]) {
    let title = format!("Schema version {current}");
    let title_dashes = WIDTH.saturating_sub(title.len() + 7);
    let inner = WIDTH - 4;

    let row = |text: &str| format!("│ {text:<inner$} │");

    println!("╭─── {title} {}╮", "─".repeat(title_dashes));
    if statuses.is_empty() {
        println!("{}", row("no migrations in catalog"));
    }
    for s in statuses {
        let state = match (&s.applied, &s.failed) {
            (Some(entry), _) => format!("applied {}", entry.applied_at.format("%Y-%m-%d %H:%M:%S")),
            (None, Some(_)) => "FAILED, needs recovery".to_string(),
            (None, None) => "pending".to_string(),
        };
        let drift = if s.checksum_matches { "" } else { "  (modified)" };
        let name: String = s.name.chars().take(28).collect();
        println!("{}", row(&format!("{:>6}  {name:<28}  {state}{drift}", s.version)));
    }
    println!("╰{}╯", "─".repeat(WIDTH - 2));
}

pub fn print_apply(report: &ApplyReport) {
    let verb = match (report.direction, report.dry_run) {
        (Direction::Up, false) => "applied",
        (Direction::Down, false) => "reverted",
        (Direction::Up, true) => "would apply",
        (Direction::Down, true) => "would revert",
    };

    if report.applied.is_empty() {
        println!("nothing to do");
        return;
    }
    println!(
        "{verb} {} migration{} {:?} in {:.2?}",
        report.applied.len(),
        if report.applied.len() == 1 { "" } else { "s" },
        report.applied,
        report.elapsed
    );
}
