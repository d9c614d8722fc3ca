use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use std::io::{Read, Write};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PtyError {
    #[error("empty agent command")]
    EmptyCommand,

    #[error("failed to open pty: {0}")]
    OpenPty(#[source] anyhow::Error),

    #[error("failed to spawn command: {0}")]
    SpawnCommand(#[source] anyhow::Error),

    #[error("failed to clone reader: {0}")]
    CloneReader(#[source] anyhow::Error),

    #[error("failed to take writer: {0}")]
    TakeWriter(#[source] anyhow::Error),

    #[error("failed to resize pty: {0}")]
    Resize(#[source] anyhow::Error),
}

/// The agent process running on the slave side of a fresh pty.
pub struct Pty {
    master: Box<dyn MasterPty + Send>,
    child: Option<Box<dyn Child + Send + Sync>>,
}

fn pty_size(rows: u16, cols: u16) -> PtySize {
    PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

impl Pty {
    pub fn spawn(
        command: &[String],
        working_dir: Option<&Path>,
        rows: u16,
        cols: u16,
    ) -> Result<Self, PtyError> {
        let (program, args) = command.split_first().ok_or(PtyError::EmptyCommand)?;
        let pair = native_pty_system()
            .openpty(pty_size(rows, cols))
            .map_err(PtyError::OpenPty)?;

        let mut cmd = CommandBuilder::new(program);
        cmd.args(args);
        if let Some(dir) = working_dir {
            cmd.cwd(dir);
        }
        cmd.env(
            "TERM",
            std::env::var("TERM").unwrap_or_else(|_| "xterm-256color".to_string()),
        );

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(PtyError::SpawnCommand)?;
        // Only the child should hold the slave side, so EOF reaches the reader.
        drop(pair.slave);

        Ok(Self {
            master: pair.master,
            child: Some(child),
        })
    }

    pub fn take_reader(&self) -> Result<Box<dyn Read + Send>, PtyError> {
        self.master.try_clone_reader().map_err(PtyError::CloneReader)
    }

    pub fn take_writer(&self) -> Result<Box<dyn Write + Send>, PtyError> {
        self.master.take_writer().map_err(PtyError::TakeWriter)
    }

    pub fn take_child(&mut self) -> Option<Box<dyn Child + Send + Sync>> {
        self.child.take()
    }

    pub fn resize(&self, rows: u16, cols: u16) -> Result<(), PtyError> {
        self.master
            .resize(pty_size(rows, cols))
            .map_err(PtyError::Resize)
    }
}
