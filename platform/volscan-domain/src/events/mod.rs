pub mod anomaly_event;
