//! In-memory stand-ins for the cloud services, for unit tests.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{Arc, Mutex},
};

use crate::{errors::StageError, prelude::*};

use super::{JobState, ObjectStore, OcrService, RecognitionJob, RecognitionRequest, RemoteObjectRef};

/// An [`ObjectStore`] that keeps everything in a map, and remembers what
/// was asked of it.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<BTreeMap<(String, String), Vec<u8>>>,
    failing_gets: Mutex<HashSet<String>>,
    failing_puts: Mutex<HashSet<String>>,
    failing_lists: Mutex<HashSet<String>>,
    list_calls: Mutex<Vec<String>>,
}

impl MemoryObjectStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Store an object directly.
    pub fn insert(&self, bucket: &str, key: &str, data: impl Into<Vec<u8>>) {
        self.objects
            .lock()
            .expect("lock poisoned")
            .insert((bucket.to_owned(), key.to_owned()), data.into());
    }

    /// Read an object directly.
    pub fn object(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        self.objects
            .lock()
            .expect("lock poisoned")
            .get(&(bucket.to_owned(), key.to_owned()))
            .cloned()
    }

    /// How many objects are stored?
    pub fn len(&self) -> usize {
        self.objects.lock().expect("lock poisoned").len()
    }

    /// Make downloads of `key` fail.
    pub fn fail_get(&self, key: &str) {
        self.failing_gets
            .lock()
            .expect("lock poisoned")
            .insert(key.to_owned());
    }

    /// Make uploads to `key` fail.
    pub fn fail_put(&self, key: &str) {
        self.failing_puts
            .lock()
            .expect("lock poisoned")
            .insert(key.to_owned());
    }

    /// Make listings of `prefix` fail.
    pub fn fail_list(&self, prefix: &str) {
        self.failing_lists
            .lock()
            .expect("lock poisoned")
            .insert(prefix.to_owned());
    }

    /// Every prefix we were asked to list.
    pub fn list_calls(&self) -> Vec<String> {
        self.list_calls.lock().expect("lock poisoned").clone()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, target: &RemoteObjectRef, data: Vec<u8>) -> Result<()> {
        if self
            .failing_puts
            .lock()
            .expect("lock poisoned")
            .contains(&target.key)
        {
            return Err(anyhow!("permission denied for {}", target));
        }
        self.insert(&target.bucket, &target.key, data);
        Ok(())
    }

    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>> {
        self.list_calls
            .lock()
            .expect("lock poisoned")
            .push(prefix.to_owned());
        if self
            .failing_lists
            .lock()
            .expect("lock poisoned")
            .contains(prefix)
        {
            return Err(anyhow!("service unavailable while listing gs://{}/{}", bucket, prefix));
        }
        Ok(self
            .objects
            .lock()
            .expect("lock poisoned")
            .keys()
            .filter(|(b, key)| b == bucket && key.starts_with(prefix))
            .map(|(_, key)| key.clone())
            .collect())
    }

    async fn get(&self, source: &RemoteObjectRef) -> Result<Vec<u8>> {
        if self
            .failing_gets
            .lock()
            .expect("lock poisoned")
            .contains(&source.key)
        {
            return Err(anyhow!("connection reset while downloading {}", source));
        }
        self.object(&source.bucket, &source.key)
            .ok_or_else(|| anyhow!("no such object: {}", source))
    }
}

/// How a [`ScriptedOcrService`] should treat one input document.
#[derive(Clone, Debug)]
pub enum Script {
    /// Finish after `polls` pending polls, writing these `(file name,
    /// contents)` result objects into the destination prefix.
    Complete {
        polls: usize,
        outputs: Vec<(String, String)>,
    },
    /// Reject the submission.
    Reject(String),
    /// Report a failed job on the first poll.
    Fail(String),
    /// Stay pending forever.
    Hang,
}

/// State of one submitted job.
struct ScriptedJob {
    script: Script,
    destination: RemoteObjectRef,
    polls: usize,
}

/// An [`OcrService`] that follows a per-document script, keyed by the input
/// object's key. Unscripted inputs complete immediately with no output.
pub struct ScriptedOcrService {
    store: Arc<MemoryObjectStore>,
    scripts: HashMap<String, Script>,
    jobs: Mutex<HashMap<String, ScriptedJob>>,
    submitted: Mutex<Vec<RecognitionRequest>>,
}

impl ScriptedOcrService {
    pub fn new(store: Arc<MemoryObjectStore>) -> Self {
        Self {
            store,
            scripts: HashMap::new(),
            jobs: Mutex::new(HashMap::new()),
            submitted: Mutex::new(Vec::new()),
        }
    }

    /// Script the behavior for the input object `key`.
    pub fn with_script(mut self, key: &str, script: Script) -> Self {
        self.scripts.insert(key.to_owned(), script);
        self
    }

    /// Every request we received.
    pub fn submitted(&self) -> Vec<RecognitionRequest> {
        self.submitted.lock().expect("lock poisoned").clone()
    }
}

#[async_trait]
impl OcrService for ScriptedOcrService {
    async fn submit(
        &self,
        request: &RecognitionRequest,
    ) -> Result<RecognitionJob, StageError> {
        self.submitted
            .lock()
            .expect("lock poisoned")
            .push(request.clone());
        let script = self
            .scripts
            .get(&request.input.key)
            .cloned()
            .unwrap_or(Script::Complete {
                polls: 0,
                outputs: vec![],
            });
        if let Script::Reject(reason) = &script {
            return Err(StageError::Submission(reason.clone()));
        }
        let mut jobs = self.jobs.lock().expect("lock poisoned");
        let name = format!("operations/{}", jobs.len() + 1);
        jobs.insert(
            name.clone(),
            ScriptedJob {
                script,
                destination: request.destination.clone(),
                polls: 0,
            },
        );
        Ok(RecognitionJob { name })
    }

    async fn poll(&self, job: &RecognitionJob) -> Result<JobState> {
        let mut jobs = self.jobs.lock().expect("lock poisoned");
        let state = jobs
            .get_mut(&job.name)
            .ok_or_else(|| anyhow!("unknown operation {}", job.name))?;
        state.polls += 1;
        match &state.script {
            Script::Complete { polls, outputs } if state.polls > *polls => {
                for (name, contents) in outputs {
                    let key = format!("{}{}", state.destination.key, name);
                    self.store
                        .insert(&state.destination.bucket, &key, contents.clone());
                }
                Ok(JobState::Completed)
            }
            Script::Complete { .. } | Script::Hang => Ok(JobState::Pending),
            Script::Fail(reason) => Ok(JobState::Failed(reason.clone())),
            Script::Reject(_) => unreachable!("rejected jobs are never created"),
        }
    }
}
