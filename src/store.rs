/// Interface to the component that keeps finalized measurements.
///
/// The storage engine lives elsewhere; `MemoryStore` is an in-process
/// implementation of the same contract.
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tracing::{debug, error};

use crate::error::StoreError;

/// A group of measurements run together (e.g. one website list).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultRecord {
    pub id: i64,
    pub test_group_name: String,
    pub start_time: SystemTime,
    pub network_id: i64,
    pub measurement_dir: PathBuf,
    pub is_done: bool,
    pub is_uploaded: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MeasurementRecord {
    pub id: i64,
    pub report_id: Option<String>,
    pub test_name: String,
    pub result_id: i64,
    pub file_path: PathBuf,
    pub url: Option<String>,
    pub start_time: SystemTime,
    pub is_failed: bool,
    pub is_done: bool,
    pub is_uploaded: bool,
    /// None when the test keys carry no anomaly notion.
    pub is_anomaly: Option<bool>,
    pub test_keys: String,
}

pub trait ResultStore: Send + Sync {
    fn create_result(
        &self,
        home: &Path,
        test_group_name: &str,
        network_id: i64,
    ) -> Result<ResultRecord, StoreError>;

    fn create_measurement(
        &self,
        report_id: Option<&str>,
        test_name: &str,
        measurement_dir: &Path,
        idx: usize,
        result_id: i64,
        url: Option<&str>,
    ) -> Result<MeasurementRecord, StoreError>;

    /// Attaches serialized test keys to a measurement.
    fn add_test_keys(
        &self,
        msmt: &mut MeasurementRecord,
        test_keys: String,
        is_anomaly: Option<bool>,
    ) -> Result<(), StoreError>;

    fn mark_uploaded(&self, measurement_id: i64) -> Result<(), StoreError>;

    /// A result is uploaded once all of its measurements are.
    fn update_uploaded_status(&self, result_id: i64) -> Result<bool, StoreError>;

    /// Measurements of a result, oldest first.
    fn list_measurements(&self, result_id: i64) -> Result<Vec<MeasurementRecord>, StoreError>;

    fn get_measurement_json(&self, measurement_id: i64) -> Result<serde_json::Value, StoreError>;

    fn delete_result(&self, result_id: i64) -> Result<(), StoreError>;
}

/// Where a measurement's JSON lives inside its result directory.
pub fn measurement_file_path(measurement_dir: &Path, test_name: &str, idx: usize) -> PathBuf {
    measurement_dir.join(format!("msmt-{test_name}-{idx}.json"))
}

fn results_dir(home: &Path, test_group_name: &str, start: SystemTime) -> PathBuf {
    let secs = start
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    home.join("msmts").join(format!("{test_group_name}-{secs}"))
}

#[derive(Default)]
struct MemoryInner {
    next_result_id: i64,
    next_measurement_id: i64,
    results: BTreeMap<i64, ResultRecord>,
    measurements: BTreeMap<i64, MeasurementRecord>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryInner>, StoreError> {
        self.inner.lock().map_err(|_| StoreError::Poisoned)
    }
}

impl ResultStore for MemoryStore {
    fn create_result(
        &self,
        home: &Path,
        test_group_name: &str,
        network_id: i64,
    ) -> Result<ResultRecord, StoreError> {
        let start_time = SystemTime::now();
        let mut inner = self.lock()?;
        inner.next_result_id += 1;
        let result = ResultRecord {
            id: inner.next_result_id,
            test_group_name: test_group_name.to_string(),
            start_time,
            network_id,
            measurement_dir: results_dir(home, test_group_name, start_time),
            is_done: false,
            is_uploaded: false,
        };
        debug!(result_id = result.id, test_group_name, "creating result");
        inner.results.insert(result.id, result.clone());
        Ok(result)
    }

    fn create_measurement(
        &self,
        report_id: Option<&str>,
        test_name: &str,
        measurement_dir: &Path,
        idx: usize,
        result_id: i64,
        url: Option<&str>,
    ) -> Result<MeasurementRecord, StoreError> {
        let mut inner = self.lock()?;
        if !inner.results.contains_key(&result_id) {
            return Err(StoreError::NoSuchResult(result_id));
        }
        inner.next_measurement_id += 1;
        let msmt = MeasurementRecord {
            id: inner.next_measurement_id,
            report_id: report_id.map(str::to_string),
            test_name: test_name.to_string(),
            result_id,
            file_path: measurement_file_path(measurement_dir, test_name, idx),
            url: url.map(str::to_string),
            start_time: SystemTime::now(),
            is_failed: false,
            is_done: false,
            is_uploaded: false,
            is_anomaly: None,
            test_keys: String::new(),
        };
        inner.measurements.insert(msmt.id, msmt.clone());
        Ok(msmt)
    }

    fn add_test_keys(
        &self,
        msmt: &mut MeasurementRecord,
        test_keys: String,
        is_anomaly: Option<bool>,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        let stored = inner
            .measurements
            .get_mut(&msmt.id)
            .ok_or(StoreError::NoSuchMeasurement(msmt.id))?;
        msmt.test_keys = test_keys;
        msmt.is_anomaly = is_anomaly;
        msmt.is_done = true;
        *stored = msmt.clone();
        Ok(())
    }

    fn mark_uploaded(&self, measurement_id: i64) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        let msmt = inner
            .measurements
            .get_mut(&measurement_id)
            .ok_or(StoreError::NoSuchMeasurement(measurement_id))?;
        msmt.is_uploaded = true;
        Ok(())
    }

    fn update_uploaded_status(&self, result_id: i64) -> Result<bool, StoreError> {
        let mut inner = self.lock()?;
        let (uploaded, total) = inner
            .measurements
            .values()
            .filter(|m| m.result_id == result_id)
            .fold((0usize, 0usize), |(u, t), m| (u + usize::from(m.is_uploaded), t + 1));
        let result = inner
            .results
            .get_mut(&result_id)
            .ok_or(StoreError::NoSuchResult(result_id))?;
        result.is_uploaded = uploaded == total;
        Ok(result.is_uploaded)
    }

    fn list_measurements(&self, result_id: i64) -> Result<Vec<MeasurementRecord>, StoreError> {
        let inner = self.lock()?;
        if !inner.results.contains_key(&result_id) {
            return Err(StoreError::NoSuchResult(result_id));
        }
        let mut out: Vec<_> = inner
            .measurements
            .values()
            .filter(|m| m.result_id == result_id)
            .cloned()
            .collect();
        out.sort_by_key(|m| m.start_time);
        Ok(out)
    }

    fn get_measurement_json(&self, measurement_id: i64) -> Result<serde_json::Value, StoreError> {
        let inner = self.lock()?;
        let msmt = inner
            .measurements
            .get(&measurement_id)
            .ok_or(StoreError::NoSuchMeasurement(measurement_id))?;
        serde_json::from_str(&msmt.test_keys).map_err(|err| {
            error!(measurement_id, error = %err, "failed to unmarshal the measurement json");
            StoreError::InvalidJson(err.to_string())
        })
    }

    fn delete_result(&self, result_id: i64) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        if inner.results.remove(&result_id).is_none() {
            return Err(StoreError::NoSuchResult(result_id));
        }
        inner.measurements.retain(|_, m| m.result_id != result_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn measurement_paths_follow_test_name_and_index() {
        let store = MemoryStore::new();
        let result = store
            .create_result(Path::new("/home/probe"), "websites", 7)
            .unwrap();
        assert!(result.measurement_dir.starts_with("/home/probe/msmts"));
        let msmt = store
            .create_measurement(
                Some("20261019T000000Z_webconnectivity_IT_1234_n1_abc"),
                "web_connectivity",
                &result.measurement_dir,
                3,
                result.id,
                Some("https://example.com/"),
            )
            .unwrap();
        assert_eq!(
            msmt.file_path,
            result.measurement_dir.join("msmt-web_connectivity-3.json")
        );
    }

    #[test]
    fn uploaded_only_when_every_measurement_is() {
        let store = MemoryStore::new();
        let result = store.create_result(Path::new("/tmp"), "websites", 1).unwrap();
        let a = store
            .create_measurement(None, "web_connectivity", &result.measurement_dir, 0, result.id, None)
            .unwrap();
        let b = store
            .create_measurement(None, "web_connectivity", &result.measurement_dir, 1, result.id, None)
            .unwrap();
        store.mark_uploaded(a.id).unwrap();
        assert!(!store.update_uploaded_status(result.id).unwrap());
        store.mark_uploaded(b.id).unwrap();
        assert!(store.update_uploaded_status(result.id).unwrap());
    }

    #[test]
    fn delete_removes_measurements() {
        let store = MemoryStore::new();
        let result = store.create_result(Path::new("/tmp"), "websites", 1).unwrap();
        let mut msmt = store
            .create_measurement(None, "web_connectivity", &result.measurement_dir, 0, result.id, None)
            .unwrap();
        store
            .add_test_keys(&mut msmt, r#"{"blocking": false}"#.to_string(), Some(false))
            .unwrap();
        assert_eq!(store.list_measurements(result.id).unwrap().len(), 1);
        assert_eq!(
            store.get_measurement_json(msmt.id).unwrap()["blocking"],
            serde_json::json!(false)
        );
        store.delete_result(result.id).unwrap();
        assert_eq!(store.list_measurements(result.id), Err(StoreError::NoSuchResult(result.id)));
        assert_eq!(
            store.get_measurement_json(msmt.id),
            Err(StoreError::NoSuchMeasurement(msmt.id))
        );
    }

    #[test]
    fn empty_test_keys_are_not_json() {
        let store = MemoryStore::new();
        let result = store.create_result(Path::new("/tmp"), "websites", 1).unwrap();
        let msmt = store
            .create_measurement(None, "web_connectivity", &result.measurement_dir, 0, result.id, None)
            .unwrap();
        assert!(matches!(
            store.get_measurement_json(msmt.id),
            Err(StoreError::InvalidJson(_))
        ));
    }
}
