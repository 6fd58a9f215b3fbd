use chrono::Local;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::AgentError;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[default]
    Cn,
    En,
}

impl FromStr for Language {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cn" | "zh" => Ok(Language::Cn),
            "en" => Ok(Language::En),
            other => Err(AgentError::InvalidInput(format!("unsupported language: {other}"))),
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Language::Cn => "cn",
            Language::En => "en",
        })
    }
}

const ACTIONS: &str = r#"do(action="Launch", app="xxx")
do(action="Tap", element=[x, y])
do(action="Tap", element=[x, y], message="important operation")
do(action="Double Tap", element=[x, y])
do(action="Long Press", element=[x, y])
do(action="Type", text="xxx")
do(action="Swipe", start=[x1, y1], end=[x2, y2])
do(action="Back")
do(action="Home")
do(action="Wait", duration="x seconds")
do(action="Take_over", message="xxx")
finish(message="xxx")"#;

const EN_PROMPT: &str = "You are an agent that operates an Android phone to complete the user's task. \
Each turn you receive a screenshot and the current foreground app. Think about the next single step, \
then output exactly one action.

Reply in the form:
<think>your reasoning</think>
<answer>one action</answer>

Available actions:
@ACTIONS@

Rules:
- Coordinates are relative: (0, 0) is the top-left and (999, 999) the bottom-right of the screen.
- Launch the target app directly instead of searching for it on the home screen.
- If a tap had no visible effect, wait or try a different element before repeating it.
- Pass a message with Tap when the operation involves payment or privacy; it will be confirmed.
- Use Take_over when a login or verification step needs a human.
- Call finish as soon as the task is complete, or when it cannot be completed, explaining why.";

const CN_PROMPT: &str = "你是一个操作安卓手机完成用户任务的智能体。每一轮你会收到当前屏幕截图和前台应用信息，\
请思考下一步该做什么，并且只输出一个操作。

回复格式：
<think>你的思考过程</think>
<answer>一个操作</answer>

可用操作：
@ACTIONS@

规则：
- 坐标为相对坐标：屏幕左上角为 (0, 0)，右下角为 (999, 999)。
- 需要打开应用时直接使用 Launch，不要在桌面上查找。
- 点击后页面没有变化时，先等待或换一个元素，不要重复同一操作。
- 涉及支付或隐私的点击请在 Tap 中附带 message，执行前会请求确认。
- 遇到登录或验证码等需要人工处理的情况，使用 Take_over。
- 任务完成或确认无法完成时立即调用 finish，并说明原因。";

/// The default system prompt for `lang`, prefixed with today's date.
pub fn system_prompt(lang: Language) -> String {
    let today = Local::now().format("%Y-%m-%d");
    let (header, body) = match lang {
        Language::Cn => (format!("今天的日期是: {today}"), CN_PROMPT),
        Language::En => (format!("Today's date is: {today}"), EN_PROMPT),
    };
    format!("{header}\n{}", body.replace("@ACTIONS@", ACTIONS))
}
