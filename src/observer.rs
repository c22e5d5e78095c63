/// Progress callback injected at the entry boundary.
///
/// Scoped to one `CubeIo` handle; there is no process-wide logger. All hooks
/// default to no-ops so implementations pick what they care about.
pub trait Observer: Send + Sync {
    fn dataset_written(&self, _dataset: &str, _partitions: usize, _rows: usize) {}
    fn dataset_copied(&self, _dataset: &str, _keys: usize) {}
    fn group_loaded(&self, _datasets: usize, _rows: usize) {}
    fn keys_deleted(&self, _count: usize) {}
}

/// Default observer; ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct Silent;

impl Observer for Silent {}

/// Prints progress to stdout.
#[derive(Debug, Default, Clone, Copy)]
pub struct Stdout;

impl Observer for Stdout {
    fn dataset_written(&self, dataset: &str, partitions: usize, rows: usize) {
        println!("Wrote dataset {dataset}: {partitions} partitions, {rows} rows");
    }

    fn dataset_copied(&self, dataset: &str, keys: usize) {
        println!("Copied dataset {dataset}: {keys} keys");
    }

    fn group_loaded(&self, datasets: usize, rows: usize) {
        println!("Loaded group from {datasets} datasets: {rows} rows");
    }

    fn keys_deleted(&self, count: usize) {
        println!("Deleted {count} keys");
    }
}
