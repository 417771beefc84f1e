//! One scheduler per configured port: holds a list of jobs and dispatches
//! the observation each one names when its time window is open, grounded
//! line-for-line in `modules/schedule.py::Scheduler`/`Job`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local, NaiveDate, NaiveTime};
use sensorflow_bus::{BusClient, Qos};
use sensorflow_protocol::{message_type, Envelope, Header, Observation};
use tracing::{debug, info};

/// A `[startTime, endTime)` window within a single day.
#[derive(Debug, Clone)]
pub struct TimePeriod {
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
}

/// A job watches one observation template and dispatches it on the port's
/// topic whenever it becomes pending. `enabled` is the schedule's own
/// on/off switch; it is distinct from the observation template's `enabled`
/// field, which `Job::run` also consults (and, for a one-time observation,
/// clears).
pub struct Job {
    name: String,
    port_name: String,
    enabled: bool,
    start_date: NaiveDate,
    end_date: NaiveDate,
    weekdays: HashMap<String, Vec<TimePeriod>>,
    template: Observation,
}

impl Job {
    pub fn new(
        name: impl Into<String>,
        port_name: impl Into<String>,
        enabled: bool,
        start_date: NaiveDate,
        end_date: NaiveDate,
        weekdays: HashMap<String, Vec<TimePeriod>>,
        template: Observation,
    ) -> Self {
        Self {
            name: name.into(),
            port_name: port_name.into(),
            enabled,
            start_date,
            end_date,
            weekdays,
            template,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// `now > endDate` (midnight of the end date), checked independent of
    /// `enabled` -- an expired job is removed from the schedule regardless.
    pub fn has_expired(&self, now: DateTime<Local>) -> bool {
        let end = self.end_date.and_time(NaiveTime::MIN);
        now.naive_local() > end
    }

    /// Schedule-level pending check: enabled, within `[startDate, endDate)`,
    /// and (if a weekday time-sheet is given) within one of the current
    /// day's periods.
    pub fn is_pending(&self, now: DateTime<Local>) -> bool {
        if !self.enabled {
            return false;
        }

        let now_naive = now.naive_local();
        let start = self.start_date.and_time(NaiveTime::MIN);
        let end = self.end_date.and_time(NaiveTime::MIN);

        if now_naive < start || now_naive >= end {
            return false;
        }

        if self.weekdays.is_empty() {
            return true;
        }

        let current_day = now.format("%A").to_string().to_lowercase();
        let Some(periods) = self.weekdays.get(&current_day) else {
            return false;
        };

        if periods.is_empty() {
            return true;
        }

        let now_time = now.time();
        periods.iter().any(|p| p.start_time <= now_time && now_time < p.end_time)
    }

    /// Dispatches the template if it (the observation, not the schedule) is
    /// enabled, clearing `onetime` observations before the clone so a
    /// second tick in the same 100ms slice cannot double-dispatch. Returns
    /// the `sleepTime` to cooperatively wait before the scheduler's next
    /// tick.
    fn run(&mut self, publish: &dyn Fn(&str, Envelope, bool)) -> Option<f64> {
        if !self.template.enabled {
            return None;
        }

        if self.template.onetime {
            self.template.enabled = false;
        }

        let mut dispatched = self.template.clone_for_dispatch();
        dispatched.receivers.insert(0, self.port_name.clone());
        dispatched.next_receiver = 1;
        dispatched.port_name = self.port_name.clone();

        let sleep_time = dispatched.sleep_time;

        debug!(job = %self.name, port = %self.port_name, "dispatching job");

        let header = Header::new(message_type::OBSERVATION, "scheduler");
        let payload = match serde_json::to_value(&dispatched) {
            Ok(v) => v,
            Err(e) => {
                tracing::error!(job = %self.name, error = %e, "observation could not be serialized");
                return Some(sleep_time);
            }
        };
        publish(&self.port_name, Envelope::new(header, payload), false);

        Some(sleep_time)
    }
}

/// One scheduler per configured port. Runs as a single `tokio` task: every
/// 100ms it drops expired jobs, then runs every pending one, sleeping
/// `sleepTime` seconds after each dispatch before moving to the next job.
pub struct Scheduler {
    name: String,
    jobs: Vec<Job>,
    bus: Arc<BusClient>,
}

impl Scheduler {
    pub fn new(name: impl Into<String>, jobs: Vec<Job>, bus: Arc<BusClient>) -> Self {
        Self { name: name.into(), jobs, bus }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Spawns the tick loop. Waits a five-second startup grace period
    /// before the first tick (the bus connection is asynchronous; this
    /// gives it room to come up), matching the original's "wait for the
    /// uplink" loop.
    pub fn spawn(mut self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;

            loop {
                let now = Local::now();
                self.jobs.retain(|job| !job.has_expired(now));

                for job in self.jobs.iter_mut() {
                    if !job.is_pending(now) {
                        continue;
                    }

                    let bus = self.bus.clone();
                    let publish = move |target: &str, envelope: Envelope, retain: bool| {
                        if let Err(e) = bus.publish(target, &envelope, Qos::AtMostOnce, retain) {
                            tracing::warn!(target, error = %e, "scheduler failed to publish observation");
                        }
                    };

                    if let Some(sleep_time) = job.run(&publish) {
                        if sleep_time > 0.0 {
                            tokio::time::sleep(Duration::from_secs_f64(sleep_time)).await;
                        }
                    }
                }

                if self.jobs.is_empty() {
                    info!(scheduler = %self.name, "no jobs remain");
                }

                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, TimeZone};

    fn job_with_range(start: NaiveDate, end: NaiveDate, weekdays: HashMap<String, Vec<TimePeriod>>) -> Job {
        Job::new(
            "j1",
            "port1",
            true,
            start,
            end,
            weekdays,
            Observation::new("obs1", "t1", vec!["exp1".into()]),
        )
    }

    #[test]
    fn pending_within_date_range_no_weekdays() {
        let today = Local::now().date_naive();
        let job = job_with_range(today, today + chrono::Duration::days(1), HashMap::new());
        assert!(job.is_pending(Local::now()));
    }

    #[test]
    fn not_pending_before_start_date() {
        let today = Local::now().date_naive();
        let job = job_with_range(today + chrono::Duration::days(1), today + chrono::Duration::days(2), HashMap::new());
        assert!(!job.is_pending(Local::now()));
    }

    #[test]
    fn expires_once_past_end_date_midnight() {
        let today = Local::now().date_naive();
        let job = job_with_range(today - chrono::Duration::days(2), today - chrono::Duration::days(1), HashMap::new());
        assert!(job.has_expired(Local::now()));
    }

    #[test]
    fn weekday_window_matches_only_configured_day_and_period() {
        let today = Local::now().date_naive();
        let mut weekdays = HashMap::new();
        weekdays.insert(
            "monday".to_string(),
            vec![TimePeriod {
                start_time: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
                end_time: NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
            }],
        );
        let job = job_with_range(today - chrono::Duration::days(30), today + chrono::Duration::days(30), weekdays);

        let monday_930 = next_weekday_at(chrono::Weekday::Mon, 9, 30);
        assert!(job.is_pending(monday_930));

        let monday_1000 = next_weekday_at(chrono::Weekday::Mon, 10, 0);
        assert!(!job.is_pending(monday_1000));

        let tuesday_930 = next_weekday_at(chrono::Weekday::Tue, 9, 30);
        assert!(!job.is_pending(tuesday_930));
    }

    fn next_weekday_at(weekday: chrono::Weekday, hour: u32, minute: u32) -> DateTime<Local> {
        let mut date = Local::now().date_naive();
        while date.weekday() != weekday {
            date += chrono::Duration::days(1);
        }
        Local.from_local_datetime(&date.and_hms_opt(hour, minute, 0).unwrap()).unwrap()
    }

    #[test]
    fn run_clears_onetime_before_dispatch_and_prepends_port() {
        let mut template = Observation::new("obs1", "t1", vec!["exp1".into()]);
        template.onetime = true;
        let mut job = Job::new("j1", "port1", true, Local::now().date_naive(), Local::now().date_naive() + chrono::Duration::days(1), HashMap::new(), template);

        let seen: std::cell::RefCell<Vec<Observation>> = std::cell::RefCell::new(Vec::new());
        let publish = |_target: &str, envelope: Envelope, _retain: bool| {
            let obs: Observation = serde_json::from_value(envelope.payload).unwrap();
            seen.borrow_mut().push(obs);
        };
        job.run(&publish);
        assert!(!job.template.enabled, "onetime template must be disabled before clone");

        let dispatched = &seen.borrow()[0];
        assert_eq!(dispatched.receivers, vec!["port1".to_string(), "exp1".to_string()]);
        assert_eq!(dispatched.next_receiver, 1);

        // A second run must be a no-op: the template is now disabled.
        job.run(&publish);
        assert_eq!(seen.borrow().len(), 1, "onetime job must dispatch exactly once");
    }
}
