/*
 * Copyright (c) 2024 Yunshan Networks
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum Error<T> {
    #[error("the queue receiving operation has timed out")]
    Timeout,
    #[error("the queue has terminated")]
    Terminated(Option<T>),
}

/// Fixed-size blocking MPSC queue.
///
/// `send` blocks while the queue is full, which is the pipeline's
/// backpressure mechanism. After `close` (explicit, or the last sender or
/// the receiver dropping) remaining items still drain before `recv`
/// reports `Error::Terminated`.
pub fn bounded<T>(size: usize) -> (Sender<T>, Receiver<T>) {
    assert!(size > 0);
    let shared = Arc::new(Shared {
        inner: Mutex::new(Inner {
            items: VecDeque::with_capacity(size),
            capacity: size,
            terminated: false,
            senders: 1,
        }),
        not_empty: Condvar::new(),
        not_full: Condvar::new(),
    });
    (
        Sender {
            shared: shared.clone(),
        },
        Receiver { shared },
    )
}

struct Inner<T> {
    items: VecDeque<T>,
    capacity: usize,
    terminated: bool,
    senders: usize,
}

struct Shared<T> {
    inner: Mutex<Inner<T>>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl<T> Shared<T> {
    fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.terminated = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }
}

pub struct Sender<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Sender<T> {
    pub fn send(&self, msg: T) -> Result<(), Error<T>> {
        let mut inner = self.shared.inner.lock().unwrap();
        loop {
            if inner.terminated {
                return Err(Error::Terminated(Some(msg)));
            }
            if inner.items.len() < inner.capacity {
                inner.items.push_back(msg);
                self.shared.not_empty.notify_one();
                return Ok(());
            }
            inner = self.shared.not_full.wait(inner).unwrap();
        }
    }

    pub fn terminated(&self) -> bool {
        self.shared.inner.lock().unwrap().terminated
    }

    /// Signals EOF to the receiver. Queued items still drain.
    pub fn close(&self) {
        self.shared.close();
    }
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        self.shared.inner.lock().unwrap().senders += 1;
        Sender {
            shared: self.shared.clone(),
        }
    }
}

impl<T> Drop for Sender<T> {
    fn drop(&mut self) {
        let last = {
            let mut inner = self.shared.inner.lock().unwrap();
            inner.senders -= 1;
            inner.senders == 0
        };
        if last {
            self.shared.close();
        }
    }
}

pub struct Receiver<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Receiver<T> {
    pub fn recv(&self, timeout: Option<Duration>) -> Result<T, Error<T>> {
        let mut inner = self.shared.inner.lock().unwrap();
        let deadline = timeout.map(|d| Instant::now() + d);
        loop {
            if let Some(msg) = inner.items.pop_front() {
                self.shared.not_full.notify_one();
                return Ok(msg);
            }
            if inner.terminated {
                return Err(Error::Terminated(None));
            }
            inner = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(Error::Timeout);
                    }
                    self.shared
                        .not_empty
                        .wait_timeout(inner, deadline - now)
                        .unwrap()
                        .0
                }
                None => self.shared.not_empty.wait(inner).unwrap(),
            };
        }
    }

    pub fn terminated(&self) -> bool {
        self.shared.inner.lock().unwrap().terminated
    }

    pub fn len(&self) -> usize {
        self.shared.inner.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Drop for Receiver<T> {
    fn drop(&mut self) {
        self.shared.close();
    }
}

impl<T> Iterator for Receiver<T> {
    type Item = T;

    fn next(&mut self) -> Option<Self::Item> {
        self.recv(None).ok()
    }
}
