use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::http::{BatchExecutor, HttpRequest, HttpResponse};
use crate::upload::Clock;

type Handler = Box<dyn Fn(&HttpRequest) -> HttpResponse + Send + Sync>;

pub struct ScriptedExecutor {
    handler: Handler,
    log: Mutex<Vec<HttpRequest>>,
    waves: Mutex<Vec<usize>>,
}

impl ScriptedExecutor {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&HttpRequest) -> HttpResponse + Send + Sync + 'static,
    {
        Self {
            handler: Box::new(handler),
            log: Mutex::new(Vec::new()),
            waves: Mutex::new(Vec::new()),
        }
    }

    /// Replays `responses` in order; panics when the script runs dry.
    pub fn sequence(responses: Vec<HttpResponse>) -> Self {
        let queue = Mutex::new(VecDeque::from(responses));
        Self::new(move |req| {
            queue
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| panic!("no scripted response left for {} {}", req.method, req.url))
        })
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.log.lock().unwrap().clone()
    }

    pub fn wave_sizes(&self) -> Vec<usize> {
        self.waves.lock().unwrap().clone()
    }
}

impl BatchExecutor for ScriptedExecutor {
    fn execute(&self, requests: Vec<HttpRequest>) -> Vec<Result<HttpResponse>> {
        self.waves.lock().unwrap().push(requests.len());
        requests
            .into_iter()
            .map(|req| {
                let resp = (self.handler)(&req);
                self.log.lock().unwrap().push(req);
                if resp.status == 0 {
                    Err(Error::Transport("connection reset".into()))
                } else {
                    Ok(resp)
                }
            })
            .collect()
    }
}

/// Clock that advances by a fixed step on every reading.
pub struct SteppingClock {
    origin: Instant,
    step: Duration,
    ticks: Mutex<u32>,
}

impl SteppingClock {
    pub fn new(step: Duration) -> Self {
        Self {
            origin: Instant::now(),
            step,
            ticks: Mutex::new(0),
        }
    }
}

impl Clock for SteppingClock {
    fn now(&self) -> Instant {
        let mut ticks = self.ticks.lock().unwrap();
        let now = self.origin + self.step * *ticks;
        *ticks += 1;
        now
    }
}

#[derive(Clone)]
pub struct ManualClock {
    origin: Instant,
    offset: std::sync::Arc<Mutex<Duration>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            offset: std::sync::Arc::new(Mutex::new(Duration::ZERO)),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.offset.lock().unwrap() += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + *self.offset.lock().unwrap()
    }
}
