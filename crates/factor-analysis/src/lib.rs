pub mod bundle;
pub mod grouping;
pub mod ic;
pub mod performance;
pub mod preprocess;
pub mod table;

pub use bundle::{build_bundle, BundleInput};
pub use grouping::{assign_groups, GroupedRow};
pub use ic::{ic_decay, ic_series, ic_summary, IcSeries, IcSummary};
pub use preprocess::{trim_outliers, zscore};
pub use table::{align, observations_from_points, AlignedRow, FactorObservation};
