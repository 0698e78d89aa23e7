pub mod burst_grouper;
