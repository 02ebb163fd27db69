// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use anyhow::Result;

use crate::context::OomdContext;
use crate::engine::ConstructionContext;
use crate::engine::MonitoredResources;
use crate::engine::Plugin;
use crate::engine::PluginArgs;
use crate::engine::PluginRet;

/// Unconditional STOP; terminates whatever chain it appears in.
#[derive(Default)]
pub struct Stop;

impl Plugin for Stop {
    fn name(&self) -> &'static str {
        "stop"
    }

    fn init(
        &mut self,
        _resources: &mut MonitoredResources,
        _args: &PluginArgs,
        _construction: &ConstructionContext,
    ) -> Result<()> {
        Ok(())
    }

    fn run(&mut self, _ctx: &mut OomdContext) -> PluginRet {
        PluginRet::Stop
    }
}
