//! Output scaling: maps delivered frame dimensions to the window.
//!
//! Resolves the stream aspect code against the user's aspect mode, fits the
//! result into the gui area (letter/pillar-boxed), and applies zoom: factors
//! above the fit enlarge the output until the gui bounds, beyond which they
//! crop the displayed rectangle instead.

use std::sync::{Arc, Mutex, Weak};

use tracing::warn;

use super::AspectCode;
use crate::config::{ConfigStore, Registration};

/// User-selected aspect handling.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
pub enum AspectMode {
    Auto,
    Square,
    FourThree,
    Anamorphic,
    Dvb,
}

impl AspectMode {
    pub fn name(self) -> &'static str {
        match self {
            AspectMode::Auto => "auto",
            AspectMode::Square => "square",
            AspectMode::FourThree => "4:3",
            AspectMode::Anamorphic => "16:9",
            AspectMode::Dvb => "2:1",
        }
    }
}

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub struct Border {
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
}

/// Window geometry reported by the embedding gui.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct GuiArea {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
    pub pixel_aspect: f64,
    pub win_x: i32,
    pub win_y: i32,
}

/// Callback into the gui answering "where does video go right now".
pub trait FrameOutput: Send + Sync {
    fn frame_output(
        &self,
        delivered_width: i32,
        delivered_height: i32,
        video_pixel_aspect: f64,
    ) -> GuiArea;
}

pub struct ScaleState {
    pub support_zoom: bool,
    pub scaling_disabled: bool,

    pub delivered_width: i32,
    pub delivered_height: i32,
    pub delivered_ratio_code: AspectCode,

    pub user_ratio: AspectMode,
    pub zoom_factor_x: f64,
    pub zoom_factor_y: f64,

    pub gui_x: i32,
    pub gui_y: i32,
    pub gui_width: i32,
    pub gui_height: i32,
    pub gui_win_x: i32,
    pub gui_win_y: i32,
    pub gui_pixel_aspect: f64,

    pub video_pixel_aspect: f64,

    pub output_width: i32,
    pub output_height: i32,
    pub output_xoffset: i32,
    pub output_yoffset: i32,

    pub displayed_width: i32,
    pub displayed_height: i32,
    pub displayed_xoffset: i32,
    pub displayed_yoffset: i32,

    /// Image position inside the gui area, 0.0 .. 1.0.
    pub output_horizontal_position: f64,
    pub output_vertical_position: f64,

    /// Letter/pillar-box bars: top, bottom, left, right.
    pub border: [Border; 4],

    pub force_redraw: bool,
    warned_unknown_ratio: bool,
}

impl ScaleState {
    pub fn new(support_zoom: bool, scaling_disabled: bool) -> ScaleState {
        ScaleState {
            support_zoom,
            scaling_disabled,
            delivered_width: 0,
            delivered_height: 0,
            delivered_ratio_code: AspectCode::Square,
            user_ratio: AspectMode::Auto,
            zoom_factor_x: 1.0,
            zoom_factor_y: 1.0,
            gui_x: 0,
            gui_y: 0,
            gui_width: 0,
            gui_height: 0,
            gui_win_x: 0,
            gui_win_y: 0,
            gui_pixel_aspect: 1.0,
            video_pixel_aspect: 1.0,
            output_width: 0,
            output_height: 0,
            output_xoffset: 0,
            output_yoffset: 0,
            displayed_width: 0,
            displayed_height: 0,
            displayed_xoffset: 0,
            displayed_yoffset: 0,
            output_horizontal_position: 0.5,
            output_vertical_position: 0.33,
            border: [Border::default(); 4],
            force_redraw: true,
            warned_unknown_ratio: false,
        }
    }

    /// Register the output position keys; live changes force a redraw.
    pub fn register_config(this: &Arc<Mutex<ScaleState>>, config: &ConfigStore) {
        let weak = Arc::downgrade(this);
        let horizontal = config.register_range(
            Registration::new("video.horizontal_position")
                .description("horizontal image position in the output window")
                .callback(position_callback(weak.clone(), |state, pos| {
                    state.output_horizontal_position = pos;
                })),
            50,
            0,
            100,
        );
        let vertical = config.register_range(
            Registration::new("video.vertical_position")
                .description("vertical image position in the output window")
                .callback(position_callback(weak, |state, pos| {
                    state.output_vertical_position = pos;
                })),
            33,
            0,
            100,
        );
        let mut state = this.lock().unwrap();
        state.output_horizontal_position = horizontal as f64 / 100.0;
        state.output_vertical_position = vertical as f64 / 100.0;
    }

    /// Resolve the desired display ratio and derive the video pixel aspect
    /// from it.
    pub fn compute_ideal_size(&mut self) {
        if self.scaling_disabled {
            self.video_pixel_aspect = self.gui_pixel_aspect;
            return;
        }

        let image_ratio = self.delivered_width as f64 / self.delivered_height as f64;
        let desired_ratio = match self.user_ratio {
            AspectMode::Auto => match self.delivered_ratio_code {
                AspectCode::Anamorphic | AspectCode::PanScan => 16.0 / 9.0,
                AspectCode::Dvb211 => 2.11,
                AspectCode::Square | AspectCode::DontTouch => image_ratio,
                AspectCode::FourThree => 4.0 / 3.0,
                AspectCode::Forbidden => {
                    if !self.warned_unknown_ratio {
                        warn!("invalid aspect ratio code in stream, using 4:3");
                        self.warned_unknown_ratio = true;
                    }
                    4.0 / 3.0
                }
            },
            AspectMode::Anamorphic => 16.0 / 9.0,
            AspectMode::Dvb => 2.0,
            AspectMode::Square => image_ratio,
            AspectMode::FourThree => 4.0 / 3.0,
        };

        self.video_pixel_aspect = desired_ratio / image_ratio;
        // Snap to the gui aspect when they are within 1% so near-square
        // pixels do not force a useless rescale.
        if (self.video_pixel_aspect / self.gui_pixel_aspect - 1.0).abs() < 0.01 {
            self.video_pixel_aspect = self.gui_pixel_aspect;
        }
    }

    /// Fit the ideal size into the gui area and compute the displayed
    /// sub-rectangle plus box borders.
    pub fn compute_output_size(&mut self) {
        let aspect = self.video_pixel_aspect / self.gui_pixel_aspect;
        let x_factor = self.gui_width as f64 / (self.delivered_width as f64 * aspect);
        let y_factor = (self.gui_height as f64 * aspect) / self.delivered_height as f64;

        if self.scaling_disabled {
            self.output_width = self.delivered_width;
            self.output_height = self.delivered_height;
            self.displayed_width = self.delivered_width;
            self.displayed_height = self.delivered_height;
        } else if self.support_zoom {
            // Window size never changes due to zoom: first grow the output
            // into any black borders, then crop the displayed rectangle.
            if x_factor <= y_factor {
                self.output_width = self.gui_width;
                self.displayed_width =
                    (self.delivered_width as f64 / self.zoom_factor_x + 0.5) as i32;

                let fit_height = (self.delivered_height as f64 * x_factor + 0.5) as i32;
                if (fit_height as f64 * self.zoom_factor_y) as i32 <= self.gui_height {
                    self.displayed_height = self.delivered_height;
                    self.output_height = (fit_height as f64 * self.zoom_factor_y + 0.5) as i32;
                } else {
                    self.displayed_height = (self.delivered_height as f64
                        * self.gui_height as f64
                        / fit_height as f64
                        / self.zoom_factor_y
                        + 0.5) as i32;
                    self.output_height = self.gui_height;
                }
            } else {
                self.output_height = self.gui_height;
                self.displayed_height =
                    (self.delivered_height as f64 / self.zoom_factor_y + 0.5) as i32;

                let fit_width = (self.delivered_width as f64 * y_factor + 0.5) as i32;
                if (fit_width as f64 * self.zoom_factor_x) as i32 <= self.gui_width {
                    self.displayed_width = self.delivered_width;
                    self.output_width = (fit_width as f64 * self.zoom_factor_x + 0.5) as i32;
                } else {
                    self.displayed_width = (self.delivered_width as f64 * self.gui_width as f64
                        / fit_width as f64
                        / self.zoom_factor_x
                        + 0.5) as i32;
                    self.output_width = self.gui_width;
                }
            }
        } else {
            if x_factor < y_factor {
                self.output_width = self.gui_width;
                self.output_height = (self.delivered_height as f64 * x_factor + 0.5) as i32;
            } else {
                self.output_width = (self.delivered_width as f64 * y_factor + 0.5) as i32;
                self.output_height = self.gui_height;
            }
            self.displayed_width = self.delivered_width;
            self.displayed_height = self.delivered_height;
        }

        self.output_xoffset = ((self.gui_width - self.output_width) as f64
            * self.output_horizontal_position) as i32
            + self.gui_x;
        self.output_yoffset = ((self.gui_height - self.output_height) as f64
            * self.output_vertical_position) as i32
            + self.gui_y;

        self.displayed_xoffset = (self.delivered_width - self.displayed_width) / 2;
        self.displayed_yoffset = (self.delivered_height - self.displayed_height) / 2;

        // Letter/pillar-box bars the driver has to paint black.
        if self.output_height < self.gui_height {
            self.border[0] = Border {
                x: 0,
                y: 0,
                w: self.gui_width,
                h: self.output_yoffset,
            };
            self.border[1] = Border {
                x: 0,
                y: self.output_yoffset + self.output_height,
                w: self.gui_width,
                h: self.gui_height - (self.output_yoffset + self.output_height),
            };
        } else {
            self.border[0] = Border::default();
            self.border[1] = Border::default();
        }
        if self.output_width < self.gui_width {
            self.border[2] = Border {
                x: 0,
                y: 0,
                w: self.output_xoffset,
                h: self.gui_height,
            };
            self.border[3] = Border {
                x: self.output_xoffset + self.output_width,
                y: 0,
                w: self.gui_width - (self.output_xoffset + self.output_width),
                h: self.gui_height,
            };
        } else {
            self.border[2] = Border::default();
            self.border[3] = Border::default();
        }
    }

    /// Poll the gui for its current geometry; true when the driver has to
    /// redraw (geometry changed, or something set `force_redraw`).
    pub fn redraw_needed(&mut self, output: &dyn FrameOutput) -> bool {
        let gui = output.frame_output(
            self.delivered_width,
            self.delivered_height,
            self.video_pixel_aspect,
        );

        let changed = gui.x != self.gui_x
            || gui.y != self.gui_y
            || gui.width != self.gui_width
            || gui.height != self.gui_height
            || gui.pixel_aspect != self.gui_pixel_aspect
            || gui.win_x != self.gui_win_x
            || gui.win_y != self.gui_win_y;

        if changed {
            self.gui_x = gui.x;
            self.gui_y = gui.y;
            self.gui_width = gui.width;
            self.gui_height = gui.height;
            self.gui_pixel_aspect = gui.pixel_aspect;
            self.gui_win_x = gui.win_x;
            self.gui_win_y = gui.win_y;
        }

        let redraw = changed || self.force_redraw;
        self.force_redraw = false;
        redraw
    }

    /// Map window coordinates back into delivered-frame coordinates
    /// (mouse events over the video area).
    pub fn translate_gui2video(&self, x: i32, y: i32) -> (i32, i32) {
        if self.output_width <= 0 || self.output_height <= 0 {
            return (x, y);
        }
        let x = x - self.output_xoffset;
        let y = y - self.output_yoffset;
        (
            x * self.displayed_width / self.output_width + self.displayed_xoffset,
            y * self.displayed_height / self.output_height + self.displayed_yoffset,
        )
    }
}

fn position_callback(
    state: Weak<Mutex<ScaleState>>,
    apply: impl Fn(&mut ScaleState, f64) + Send + Sync + 'static,
) -> crate::config::ConfigCallback {
    Arc::new(move |update| {
        let Some(state) = state.upgrade() else {
            return;
        };
        let Some(value) = update.value.as_num() else {
            return;
        };
        let mut state = state.lock().unwrap();
        apply(&mut state, value as f64 / 100.0);
        state.force_redraw = true;
    })
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;

    fn fitted(mut state: ScaleState) -> ScaleState {
        state.compute_ideal_size();
        state.compute_output_size();
        state
    }

    fn base_state(width: i32, height: i32, code: AspectCode) -> ScaleState {
        let mut state = ScaleState::new(false, false);
        state.delivered_width = width;
        state.delivered_height = height;
        state.delivered_ratio_code = code;
        state.gui_width = 1024;
        state.gui_height = 768;
        state.gui_pixel_aspect = 1.0;
        state
    }

    #[test]
    fn test_anamorphic_letterbox() {
        let state = fitted(base_state(720, 576, AspectCode::Anamorphic));
        assert_relative_eq!(state.video_pixel_aspect, (16.0 / 9.0) / (720.0 / 576.0));
        assert_eq!(state.output_width, 1024);
        assert_eq!(state.output_height, 576);
        // Full source displayed, bars above and below.
        assert_eq!(state.displayed_width, 720);
        assert_eq!(state.displayed_height, 576);
        assert!(state.border[0].h > 0 && state.border[1].h > 0);
        assert_eq!(state.border[2].w, 0);
    }

    #[test]
    fn test_square_pixels_pillarbox() {
        let mut state = base_state(640, 480, AspectCode::Square);
        state.gui_width = 1920;
        state.gui_height = 1080;
        let state = fitted(state);
        // 4:3 content in a 16:9 window: full height, bars left and right.
        assert_eq!(state.output_height, 1080);
        assert_eq!(state.output_width, 1440);
        assert!(state.border[2].w > 0 && state.border[3].w > 0);
        assert_eq!(state.border[0].h, 0);
    }

    #[test]
    fn test_auto_resolves_pan_scan_as_widescreen() {
        let state = fitted(base_state(720, 576, AspectCode::PanScan));
        assert_relative_eq!(
            state.output_width as f64 / state.output_height as f64,
            16.0 / 9.0,
            epsilon = 0.01
        );
    }

    #[test]
    fn test_user_ratio_overrides_stream_code() {
        let mut state = base_state(720, 576, AspectCode::Anamorphic);
        state.user_ratio = AspectMode::FourThree;
        let state = fitted(state);
        assert_relative_eq!(
            state.output_width as f64 / state.output_height as f64,
            4.0 / 3.0,
            epsilon = 0.01
        );
    }

    #[test]
    fn test_forbidden_code_falls_back_to_four_three() {
        let state = fitted(base_state(720, 576, AspectCode::Forbidden));
        assert_relative_eq!(
            state.output_width as f64 / state.output_height as f64,
            4.0 / 3.0,
            epsilon = 0.01
        );
    }

    #[test]
    fn test_zoom_within_borders_enlarges_output() {
        let mut state = base_state(640, 480, AspectCode::Square);
        state.support_zoom = true;
        state.gui_width = 640;
        state.gui_height = 640;
        state.zoom_factor_x = 1.2;
        state.zoom_factor_y = 1.2;
        let state = fitted(state);
        // Fit height is 480; zoomed output grows into the vertical borders.
        assert_eq!(state.output_width, 640);
        assert_eq!(state.output_height, 576);
        assert_eq!(state.displayed_height, 480);
    }

    #[test]
    fn test_zoom_past_gui_bounds_crops_displayed_rect() {
        let mut state = base_state(640, 480, AspectCode::Square);
        state.support_zoom = true;
        state.gui_width = 640;
        state.gui_height = 480;
        state.zoom_factor_x = 2.0;
        state.zoom_factor_y = 2.0;
        let state = fitted(state);
        assert_eq!(state.output_width, 640);
        assert_eq!(state.output_height, 480);
        // Half the source visible, centered.
        assert_eq!(state.displayed_width, 320);
        assert_eq!(state.displayed_height, 240);
        assert_eq!(state.displayed_xoffset, 160);
        assert_eq!(state.displayed_yoffset, 120);
    }

    #[test]
    fn test_translate_gui2video_centers() {
        let mut state = fitted(base_state(720, 576, AspectCode::Anamorphic));
        state.output_xoffset = 0;
        state.output_yoffset = 96;
        // Center of the output area maps to the center of the source.
        let (x, y) = state.translate_gui2video(512, 96 + 288);
        assert_eq!(x, 360);
        assert_eq!(y, 288);
    }

    #[test]
    fn test_redraw_detection() {
        struct FixedGui(Mutex<GuiArea>);
        impl FrameOutput for FixedGui {
            fn frame_output(&self, _: i32, _: i32, _: f64) -> GuiArea {
                *self.0.lock().unwrap()
            }
        }

        let gui = FixedGui(Mutex::new(GuiArea {
            width: 800,
            height: 600,
            pixel_aspect: 1.0,
            ..GuiArea::default()
        }));
        let mut state = ScaleState::new(false, false);
        state.delivered_width = 720;
        state.delivered_height = 576;

        // First call: geometry picked up, initial force_redraw consumed.
        assert!(state.redraw_needed(&gui));
        assert_eq!(state.gui_width, 800);
        // No change: no redraw.
        assert!(!state.redraw_needed(&gui));
        // Window resize: redraw.
        gui.0.lock().unwrap().width = 1024;
        assert!(state.redraw_needed(&gui));
        // Explicit force.
        state.force_redraw = true;
        assert!(state.redraw_needed(&gui));
        assert!(!state.redraw_needed(&gui));
    }

    #[test]
    fn test_config_position_callback_forces_redraw() {
        let config = ConfigStore::new();
        let state = Arc::new(Mutex::new(ScaleState::new(false, false)));
        ScaleState::register_config(&state, &config);
        assert_relative_eq!(state.lock().unwrap().output_horizontal_position, 0.5);

        state.lock().unwrap().force_redraw = false;
        config.update_num("video.vertical_position", 80).unwrap();
        let state = state.lock().unwrap();
        assert_relative_eq!(state.output_vertical_position, 0.8);
        assert!(state.force_redraw);
    }
}
