//! Listener filter pipeline.
//!
//! Listener filters inspect an accepted socket before a filter chain is
//! selected, for example to read the TLS ClientHello. A filter that needs more
//! bytes stops iteration; the pipeline remembers its position and is driven
//! forward later by data, an explicit continue, or a timeout.

use crate::network::{ConnectionSocket, FilterStatus};

/// A pre-match inspection stage.
pub trait ListenerFilter {
    fn name(&self) -> &str;

    /// Called once when the pipeline reaches this filter.
    ///
    /// To reject the socket, close it; the pipeline then terminates.
    fn on_accept(&mut self, socket: &mut dyn ConnectionSocket) -> FilterStatus;

    /// Called while this filter holds the pipeline stopped and bytes are
    /// available. `data` is everything readable so far from the start of
    /// the stream; it has not been consumed.
    fn on_data(&mut self, _socket: &mut dyn ConnectionSocket, _data: &[u8]) -> FilterStatus {
        FilterStatus::Continue
    }
}

/// Creates a fresh listener filter for every accepted socket.
pub trait ListenerFilterFactory: Send + Sync {
    fn name(&self) -> &str;
    fn create_filter(&self) -> Box<dyn ListenerFilter>;
}

/// Where a socket is in its listener filter pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Running,
    /// A filter stopped iteration and waits for an external event.
    Suspended,
    /// Every filter continued; the socket is ready for matching.
    Completed,
    /// A filter closed the socket.
    Terminated,
}

/// Runs listener filters in order, with a saved cursor for suspension.
pub struct ListenerFilterPipeline {
    filters: Vec<Box<dyn ListenerFilter>>,
    cursor: usize,
    state: PipelineState,
}

impl ListenerFilterPipeline {
    pub fn new(filters: Vec<Box<dyn ListenerFilter>>) -> Self {
        Self {
            filters,
            cursor: 0,
            state: PipelineState::Running,
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Name of the filter the pipeline is stopped at, if any.
    pub fn current_filter(&self) -> Option<&str> {
        match self.state {
            PipelineState::Suspended => self.filters.get(self.cursor).map(|f| f.name()),
            _ => None,
        }
    }

    /// Run filters from the first one.
    pub fn start(&mut self, socket: &mut dyn ConnectionSocket) -> PipelineState {
        self.cursor = 0;
        self.iterate(socket)
    }

    /// Resume after the suspended filter finished out of band.
    ///
    /// With `success == false` the socket is closed and the pipeline terminates.
    pub fn resume(&mut self, socket: &mut dyn ConnectionSocket, success: bool) -> PipelineState {
        if self.state != PipelineState::Suspended {
            return self.state;
        }
        if !success {
            return self.terminate(socket);
        }
        self.cursor += 1;
        self.iterate(socket)
    }

    /// Hand readable bytes to the suspended filter.
    pub fn on_data(&mut self, socket: &mut dyn ConnectionSocket, data: &[u8]) -> PipelineState {
        if self.state != PipelineState::Suspended {
            return self.state;
        }
        let status = match self.filters.get_mut(self.cursor) {
            Some(filter) => filter.on_data(socket, data),
            None => FilterStatus::Continue,
        };
        if !socket.is_open() {
            self.state = PipelineState::Terminated;
            return self.state;
        }
        match status {
            FilterStatus::StopIteration => self.state,
            FilterStatus::Continue => {
                self.cursor += 1;
                self.iterate(socket)
            }
        }
    }

    /// The suspended filter ran out of time.
    ///
    /// Skips the filter when `continue_on_timeout` is set, otherwise closes
    /// the socket.
    pub fn on_timeout(
        &mut self,
        socket: &mut dyn ConnectionSocket,
        continue_on_timeout: bool,
    ) -> PipelineState {
        self.resume(socket, continue_on_timeout)
    }

    fn iterate(&mut self, socket: &mut dyn ConnectionSocket) -> PipelineState {
        self.state = PipelineState::Running;
        while let Some(filter) = self.filters.get_mut(self.cursor) {
            let status = filter.on_accept(socket);
            if !socket.is_open() {
                self.state = PipelineState::Terminated;
                return self.state;
            }
            if status == FilterStatus::StopIteration {
                self.state = PipelineState::Suspended;
                return self.state;
            }
            self.cursor += 1;
        }
        self.state = PipelineState::Completed;
        self.state
    }

    fn terminate(&mut self, socket: &mut dyn ConnectionSocket) -> PipelineState {
        if socket.is_open() {
            socket.close();
        }
        self.state = PipelineState::Terminated;
        self.state
    }
}

impl std::fmt::Debug for ListenerFilterPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerFilterPipeline")
            .field("filters", &self.filters.iter().map(|f| f.name()).collect::<Vec<_>>())
            .field("cursor", &self.cursor)
            .field("state", &self.state)
            .finish()
    }
}
